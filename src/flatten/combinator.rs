//! The outer loop shared by every flattening strategy.

use std::fmt;
use std::marker::PhantomData;

use futures::future::{select, Either};
use tracing::{debug, warn};

use crate::error::{HotflowResult, ValidationError};
use crate::observer::Observer;
use crate::scheduler::SchedulerHandle;
use crate::stream::{Subscriber, SubscriberId};

use super::inner::{annotate, InnerStreamFactory};
use super::strategy::{Concat, FlattenContext, FlattenStrategy, InnerTracker, Latest, Merge, MergeConfig};

/// Turns an outer stream of keys into one output sequence of inner values.
///
/// The combinator owns its outer [`Subscriber`], so it sees exactly what was
/// published after that subscriber attached, filtered by the stream's
/// overflow policy.
pub struct FlatteningCombinator<K, V, F, S> {
    outer: Subscriber<K>,
    factory: F,
    strategy: S,
    scheduler: SchedulerHandle,
    _values: PhantomData<fn() -> V>,
}

impl<K, V, F, S> FlatteningCombinator<K, V, F, S>
where
    K: Clone + fmt::Display,
    V: 'static,
    F: InnerStreamFactory<K, V>,
    S: FlattenStrategy<V>,
{
    /// Builds a combinator with an arbitrary strategy.
    #[must_use]
    pub fn new(outer: Subscriber<K>, factory: F, strategy: S, scheduler: SchedulerHandle) -> Self {
        Self {
            outer,
            factory,
            strategy,
            scheduler,
            _values: PhantomData,
        }
    }

    /// The strategy in use.
    #[must_use]
    pub const fn strategy(&self) -> &S {
        &self.strategy
    }

    /// Id of the outer subscription.
    #[must_use]
    pub const fn subscriber_id(&self) -> SubscriberId {
        self.outer.id()
    }

    /// Consumes the outer stream until it closes, emitting every inner value
    /// into `observer`.
    ///
    /// Returns `Ok(())` once the outer stream is closed and all retained inner
    /// work has finished. On failure, in-flight inner tasks are cancelled and
    /// stopped before the error is returned.
    pub async fn run<O>(mut self, observer: O) -> HotflowResult<()>
    where
        O: Observer<V> + 'static,
    {
        let ctx = FlattenContext::new(self.scheduler.clone(), observer);
        let strategy = self.strategy.name();
        debug!(strategy, subscriber = %self.outer.id(), "flattening started");

        let result = self.drive(&ctx).await;
        match &result {
            Ok(()) => debug!(strategy, now = self.scheduler.now(), "flattening completed"),
            Err(err) => {
                warn!(strategy, error = %err, "flattening failed");
                self.strategy.abort(&ctx).await;
            }
        }
        result
    }

    async fn drive(&mut self, ctx: &FlattenContext<V>) -> HotflowResult<()> {
        loop {
            if let Some(err) = ctx.tracker.take_failure() {
                return Err(err);
            }
            let key = match select(ctx.tracker.until(InnerTracker::has_failure), self.outer.next()).await {
                Either::Left(((), _)) => continue,
                Either::Right((Ok(key), _)) => key,
                Either::Right((Err(err), _)) if err.is_terminal() => break,
                Either::Right((Err(err), _)) => return Err(err),
            };

            let label = key.to_string();
            let inner = self.factory.load(&key).map_err(|err| annotate(&label, err))?;
            debug!(strategy = self.strategy.name(), key = %label, now = self.scheduler.now(), "inner sequence started");
            self.strategy.on_outer_key(ctx, label, inner).await?;
        }

        self.strategy.finish(ctx).await;
        ctx.tracker.take_failure().map_or(Ok(()), Err)
    }
}

impl<K, V, F> FlatteningCombinator<K, V, F, Concat>
where
    K: Clone + fmt::Display,
    V: 'static,
    F: InnerStreamFactory<K, V>,
{
    /// Sequential flattening: one inner sequence at a time, in key order.
    #[must_use]
    pub fn concat(outer: Subscriber<K>, factory: F, scheduler: SchedulerHandle) -> Self {
        Self::new(outer, factory, Concat, scheduler)
    }
}

impl<K, V, F> FlatteningCombinator<K, V, F, Merge>
where
    K: Clone + fmt::Display,
    V: 'static,
    F: InnerStreamFactory<K, V>,
{
    /// Concurrent flattening.
    pub fn merge(
        outer: Subscriber<K>,
        factory: F,
        scheduler: SchedulerHandle,
        config: MergeConfig,
    ) -> Result<Self, ValidationError> {
        Ok(Self::new(outer, factory, Merge::new(config)?, scheduler))
    }
}

impl<K, V, F> FlatteningCombinator<K, V, F, Latest>
where
    K: Clone + fmt::Display,
    V: 'static,
    F: InnerStreamFactory<K, V>,
{
    /// Switch-to-latest flattening.
    #[must_use]
    pub fn latest(outer: Subscriber<K>, factory: F, scheduler: SchedulerHandle) -> Self {
        Self::new(outer, factory, Latest::new(), scheduler)
    }
}

impl<K, V, F, S: fmt::Debug> fmt::Debug for FlatteningCombinator<K, V, F, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlatteningCombinator")
            .field("outer", &self.outer.id())
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::stream::{self, StreamExt};

    use crate::error::{ExecutionError, HotflowError};
    use crate::flatten::inner::{paced_sequence, InnerSequence};
    use crate::observer::RecordingObserver;
    use crate::policy::HotStreamConfig;
    use crate::scheduler::{Scheduler, Ticks};
    use crate::stream::{HotStream, Publisher, PublisherConfig};

    fn letters(handle: SchedulerHandle, delay: Ticks) -> impl Fn(&String) -> HotflowResult<InnerSequence<String>> {
        move |key: &String| {
            let values = (1..=3).map(|i| format!("{key}_{i}")).collect();
            Ok(paced_sequence(handle.clone(), delay, values))
        }
    }

    fn publish(handle: &SchedulerHandle, stream: HotStream<String>, keys: &[&str]) {
        let keys: Vec<String> = keys.iter().map(|k| (*k).to_string()).collect();
        let publisher = Publisher::new(stream, handle.clone(), PublisherConfig::default());
        handle.spawn(publisher.run(keys));
    }

    fn expected(keys: &[&str]) -> Vec<String> {
        keys.iter().flat_map(|k| (1..=3).map(move |i| format!("{k}_{i}"))).collect()
    }

    #[test]
    fn concat_completes_when_outer_closes() {
        let mut scheduler = Scheduler::new();
        let handle = scheduler.handle();
        let stream = HotStream::new(HotStreamConfig::default()).unwrap();
        let combinator = FlatteningCombinator::concat(stream.subscribe(), letters(handle.clone(), 500), handle.clone());
        publish(&handle, stream, &["A", "B"]);

        let recorder = RecordingObserver::new();
        scheduler.block_on(combinator.run(recorder.clone())).unwrap().unwrap();

        assert_eq!(recorder.values(), expected(&["A", "B"]));
        assert_eq!(scheduler.now(), 3100);
    }

    #[test]
    fn factory_failure_halts_concat() {
        let mut scheduler = Scheduler::new();
        let handle = scheduler.handle();
        let stream = HotStream::new(HotStreamConfig::default()).unwrap();
        let good = letters(handle.clone(), 500);
        let factory = move |key: &String| -> HotflowResult<InnerSequence<String>> {
            if key == "B" {
                return Err(HotflowError::internal("no such key"));
            }
            good(key)
        };
        let combinator = FlatteningCombinator::concat(stream.subscribe(), factory, handle.clone());
        publish(&handle, stream, &["A", "B", "C"]);

        let recorder = RecordingObserver::new();
        let err = scheduler.block_on(combinator.run(recorder.clone())).unwrap().unwrap_err();

        let HotflowError::Execution(ExecutionError::InnerSequenceFailure { key, reason }) = err else {
            panic!("expected inner failure");
        };
        assert_eq!(key, "B");
        assert!(reason.contains("no such key"));
        assert_eq!(recorder.values(), expected(&["A"]));
    }

    #[test]
    fn latest_discards_failure_of_superseded_key() {
        let mut scheduler = Scheduler::new();
        let handle = scheduler.handle();
        let stream = HotStream::new(HotStreamConfig::default()).unwrap();
        let good = letters(handle.clone(), 500);
        let h = handle.clone();
        let factory = move |key: &String| -> HotflowResult<InnerSequence<String>> {
            if key == "A" {
                let h = h.clone();
                return Ok(stream::once(async move {
                    h.sleep(500).await;
                    Err(HotflowError::internal("A exploded"))
                })
                .boxed_local());
            }
            good(key)
        };
        let combinator = FlatteningCombinator::latest(stream.subscribe(), factory, handle.clone());
        publish(&handle, stream, &["A", "B"]);

        let recorder = RecordingObserver::new();
        scheduler.block_on(combinator.run(recorder.clone())).unwrap().unwrap();

        assert_eq!(recorder.values(), expected(&["B"]));
    }

    #[test]
    fn latest_reports_failure_of_current_key() {
        let mut scheduler = Scheduler::new();
        let handle = scheduler.handle();
        let stream = HotStream::new(HotStreamConfig::default()).unwrap();
        let good = letters(handle.clone(), 500);
        let factory = move |key: &String| -> HotflowResult<InnerSequence<String>> {
            if key == "B" {
                let first = good(key)?.take(1);
                let fail = stream::iter([Err(HotflowError::internal("B exploded"))]);
                return Ok(first.chain(fail).boxed_local());
            }
            good(key)
        };
        let combinator = FlatteningCombinator::latest(stream.subscribe(), factory, handle.clone());
        publish(&handle, stream, &["A", "B"]);

        let recorder = RecordingObserver::new();
        let err = scheduler.block_on(combinator.run(recorder.clone())).unwrap().unwrap_err();

        assert!(err.to_string().contains("key B"));
        assert_eq!(recorder.values(), vec!["B_1".to_string()]);
        assert_eq!(scheduler.now(), 700);
    }

    #[test]
    fn merge_with_limit_one_runs_like_concat() {
        let mut scheduler = Scheduler::new();
        let handle = scheduler.handle();
        let stream = HotStream::new(HotStreamConfig::default()).unwrap();
        let combinator = FlatteningCombinator::merge(
            stream.subscribe(),
            letters(handle.clone(), 500),
            handle.clone(),
            MergeConfig::bounded(1),
        )
        .unwrap();
        publish(&handle, stream, &["A", "B", "C"]);

        let recorder = RecordingObserver::new();
        scheduler.block_on(combinator.run(recorder.clone())).unwrap().unwrap();

        assert_eq!(recorder.values(), expected(&["A", "B", "C"]));
        assert_eq!(scheduler.now(), 4600);
    }

    #[test]
    fn merge_rejects_zero_limit() {
        let scheduler = Scheduler::new();
        let handle = scheduler.handle();
        let stream: HotStream<String> = HotStream::new(HotStreamConfig::default()).unwrap();
        let result =
            FlatteningCombinator::merge(stream.subscribe(), letters(handle.clone(), 1), handle, MergeConfig::bounded(0));
        assert!(matches!(result, Err(ValidationError::ZeroConcurrency)));
    }
}
