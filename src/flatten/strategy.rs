//! Ordering strategies for the flattening combinator.
//!
//! A strategy decides what happens when the outer subscription yields a key:
//! drain it in place ([`Concat`]), run it alongside the others ([`Merge`]),
//! or replace whatever is running ([`Latest`]). All three share the
//! [`FlattenContext`] that carries the observer and the failure slot.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use futures::future::{select, Either, FutureExt, LocalBoxFuture};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ExecutionError, HotflowError, HotflowResult, ValidationError};
use crate::observer::Observer;
use crate::scheduler::{CancellationToken, JoinHandle, SchedulerHandle};

use super::inner::{annotate, InnerSequence};

/// Bookkeeping for spawned inner tasks.
#[derive(Default)]
pub(crate) struct InnerTracker {
    active: Cell<usize>,
    failure: RefCell<Option<(u64, HotflowError)>>,
    waiter: RefCell<Option<Waker>>,
}

impl InnerTracker {
    fn started(&self) {
        self.active.set(self.active.get() + 1);
    }

    fn finished(&self) {
        self.active.set(self.active.get().saturating_sub(1));
        self.notify();
    }

    /// Keeps the first failure; later ones are logged and dropped.
    fn fail(&self, generation: u64, err: HotflowError) {
        let mut slot = self.failure.borrow_mut();
        if slot.is_none() {
            *slot = Some((generation, err));
        } else {
            debug!(error = %err, "ignoring failure after the first");
        }
        drop(slot);
        self.notify();
    }

    fn discard_before(&self, generation: u64) {
        let mut slot = self.failure.borrow_mut();
        if let Some((failed, err)) = slot.take() {
            if failed < generation {
                debug!(error = %err, "discarded failure of superseded inner sequence");
            } else {
                *slot = Some((failed, err));
            }
        }
    }

    pub(crate) fn active(&self) -> usize {
        self.active.get()
    }

    pub(crate) fn has_failure(&self) -> bool {
        self.failure.borrow().is_some()
    }

    pub(crate) fn take_failure(&self) -> Option<HotflowError> {
        self.failure.borrow_mut().take().map(|(_, err)| err)
    }

    fn notify(&self) {
        if let Some(waker) = self.waiter.borrow_mut().take() {
            waker.wake();
        }
    }

    /// Completes once `ready` holds; re-checked on every task start, finish
    /// or failure.
    pub(crate) fn until<F>(&self, ready: F) -> Until<'_, F>
    where
        F: Fn(&Self) -> bool,
    {
        Until { tracker: self, ready }
    }
}

/// Future returned by [`InnerTracker::until`].
pub(crate) struct Until<'a, F> {
    tracker: &'a InnerTracker,
    ready: F,
}

impl<F> Unpin for Until<'_, F> {}

impl<F> Future for Until<'_, F>
where
    F: Fn(&InnerTracker) -> bool,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if (self.ready)(self.tracker) {
            return Poll::Ready(());
        }
        *self.tracker.waiter.borrow_mut() = Some(cx.waker().clone());
        Poll::Pending
    }
}

/// State shared by the combinator loop, its strategy and the inner tasks.
pub struct FlattenContext<V> {
    scheduler: SchedulerHandle,
    observer: Rc<RefCell<dyn Observer<V>>>,
    pub(crate) tracker: Rc<InnerTracker>,
}

impl<V: 'static> FlattenContext<V> {
    pub(crate) fn new<O>(scheduler: SchedulerHandle, observer: O) -> Self
    where
        O: Observer<V> + 'static,
    {
        Self {
            scheduler,
            observer: Rc::new(RefCell::new(observer)),
            tracker: Rc::new(InnerTracker::default()),
        }
    }

    /// The scheduler inner tasks are spawned on.
    #[must_use]
    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    /// Inner tasks currently running.
    #[must_use]
    pub fn active_inner(&self) -> usize {
        self.tracker.active()
    }

    /// Drains `inner` on the current task.
    pub async fn drain(&self, key: &str, inner: InnerSequence<V>, token: &CancellationToken) -> HotflowResult<()> {
        drain(key, inner, token, &self.observer).await
    }

    /// Drains `inner` on its own task; a failure lands in the shared failure
    /// slot tagged with `generation`.
    pub fn spawn(&self, key: String, inner: InnerSequence<V>, token: CancellationToken, generation: u64) -> JoinHandle<()> {
        let tracker = Rc::clone(&self.tracker);
        let observer = Rc::clone(&self.observer);
        tracker.started();
        self.scheduler.spawn(async move {
            match drain(&key, inner, &token, &observer).await {
                Ok(()) => debug!(%key, "inner sequence completed"),
                Err(err) if err.is_cancellation() => debug!(%key, "inner sequence cancelled"),
                Err(err) => {
                    warn!(%key, error = %err, "inner sequence failed");
                    tracker.fail(generation, err);
                }
            }
            tracker.finished();
        })
    }
}

impl<V> fmt::Debug for FlattenContext<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlattenContext")
            .field("active", &self.tracker.active())
            .field("failed", &self.tracker.has_failure())
            .finish()
    }
}

async fn drain<V: 'static>(
    key: &str,
    mut inner: InnerSequence<V>,
    token: &CancellationToken,
    observer: &RefCell<dyn Observer<V>>,
) -> HotflowResult<()> {
    loop {
        let item = match select(token.cancelled(), inner.next()).await {
            Either::Left(_) => return Err(ExecutionError::Cancelled.into()),
            Either::Right((item, _)) => item,
        };
        let Some(item) = item else {
            return Ok(());
        };
        let value = item.map_err(|err| annotate(key, err))?;
        // Cancelled while the element was being produced.
        if token.is_cancelled() {
            return Err(ExecutionError::Cancelled.into());
        }
        observer.borrow_mut().on_next(value);
    }
}

/// How a flattening combinator orders inner sequences.
///
/// The combinator calls [`on_outer_key`](Self::on_outer_key) for each key and
/// does not read the next key until the returned future completes. When the
/// outer stream closes it calls [`finish`](Self::finish); on any error it
/// calls [`abort`](Self::abort) before returning.
pub trait FlattenStrategy<V: 'static> {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Starts (or runs) the inner sequence for a freshly read key.
    fn on_outer_key<'a>(
        &'a mut self,
        ctx: &'a FlattenContext<V>,
        key: String,
        inner: InnerSequence<V>,
    ) -> LocalBoxFuture<'a, HotflowResult<()>>;

    /// Waits for in-flight inner work once no more keys will arrive.
    fn finish<'a>(&'a mut self, ctx: &'a FlattenContext<V>) -> LocalBoxFuture<'a, ()>;

    /// Cancels in-flight inner work and waits until every task has stopped.
    fn abort<'a>(&'a mut self, ctx: &'a FlattenContext<V>) -> LocalBoxFuture<'a, ()>;
}

impl<V: 'static, S: FlattenStrategy<V> + ?Sized> FlattenStrategy<V> for Box<S> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn on_outer_key<'a>(
        &'a mut self,
        ctx: &'a FlattenContext<V>,
        key: String,
        inner: InnerSequence<V>,
    ) -> LocalBoxFuture<'a, HotflowResult<()>> {
        (**self).on_outer_key(ctx, key, inner)
    }

    fn finish<'a>(&'a mut self, ctx: &'a FlattenContext<V>) -> LocalBoxFuture<'a, ()> {
        (**self).finish(ctx)
    }

    fn abort<'a>(&'a mut self, ctx: &'a FlattenContext<V>) -> LocalBoxFuture<'a, ()> {
        (**self).abort(ctx)
    }
}

/// Drains each inner sequence to completion before reading the next key.
#[derive(Debug, Default, Clone, Copy)]
pub struct Concat;

impl<V: 'static> FlattenStrategy<V> for Concat {
    fn name(&self) -> &'static str {
        "concat"
    }

    fn on_outer_key<'a>(
        &'a mut self,
        ctx: &'a FlattenContext<V>,
        key: String,
        inner: InnerSequence<V>,
    ) -> LocalBoxFuture<'a, HotflowResult<()>> {
        async move {
            let token = CancellationToken::new();
            ctx.drain(&key, inner, &token).await?;
            debug!(%key, "inner sequence completed");
            Ok(())
        }
        .boxed_local()
    }

    fn finish<'a>(&'a mut self, _ctx: &'a FlattenContext<V>) -> LocalBoxFuture<'a, ()> {
        async {}.boxed_local()
    }

    fn abort<'a>(&'a mut self, _ctx: &'a FlattenContext<V>) -> LocalBoxFuture<'a, ()> {
        async {}.boxed_local()
    }
}

/// Limits for [`Merge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Maximum inner sequences drained at once; `None` (the default) is
    /// unbounded. Coroutine `flatMapMerge` operators cap this at 16 by
    /// default; `MergeConfig::bounded(16)` reproduces that.
    /// Reading keys pauses while the limit is reached.
    pub concurrency: Option<usize>,
}

impl MergeConfig {
    /// Bounded merge.
    #[must_use]
    pub const fn bounded(concurrency: usize) -> Self {
        Self {
            concurrency: Some(concurrency),
        }
    }

    /// Validates the limit.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self.concurrency {
            Some(0) => Err(ValidationError::ZeroConcurrency),
            _ => Ok(()),
        }
    }
}

/// Drains every inner sequence concurrently; output interleaves in
/// production order.
///
/// Fails fast: the first inner failure cancels every other inner task.
#[derive(Debug, Default)]
pub struct Merge {
    config: MergeConfig,
    running: Vec<(CancellationToken, JoinHandle<()>)>,
}

impl Merge {
    /// Creates a merge strategy.
    pub fn new(config: MergeConfig) -> Result<Self, ValidationError> {
        config.validate()?;
        Ok(Self {
            config,
            running: Vec::new(),
        })
    }

    /// The configured limits.
    #[must_use]
    pub const fn config(&self) -> MergeConfig {
        self.config
    }
}

impl<V: 'static> FlattenStrategy<V> for Merge {
    fn name(&self) -> &'static str {
        "merge"
    }

    fn on_outer_key<'a>(
        &'a mut self,
        ctx: &'a FlattenContext<V>,
        key: String,
        inner: InnerSequence<V>,
    ) -> LocalBoxFuture<'a, HotflowResult<()>> {
        async move {
            if let Some(limit) = self.config.concurrency {
                if ctx.tracker.active() >= limit {
                    debug!(%key, limit, "merge concurrency limit reached");
                }
                ctx.tracker.until(|t| t.active() < limit || t.has_failure()).await;
                if ctx.tracker.has_failure() {
                    // The combinator loop picks the failure up before the next key.
                    return Ok(());
                }
            }
            self.running.retain(|(_, join)| !join.is_finished());
            let token = CancellationToken::new();
            let join = ctx.spawn(key, inner, token.clone(), 0);
            self.running.push((token, join));
            Ok(())
        }
        .boxed_local()
    }

    fn finish<'a>(&'a mut self, ctx: &'a FlattenContext<V>) -> LocalBoxFuture<'a, ()> {
        async move {
            ctx.tracker.until(|t| t.active() == 0 || t.has_failure()).await;
        }
        .boxed_local()
    }

    fn abort<'a>(&'a mut self, _ctx: &'a FlattenContext<V>) -> LocalBoxFuture<'a, ()> {
        async move {
            let running = std::mem::take(&mut self.running);
            for (token, _) in &running {
                token.cancel();
            }
            let count = running.len();
            for (_, join) in running {
                join.await;
            }
            debug!(count, "merge inner tasks stopped");
        }
        .boxed_local()
    }
}

struct Current {
    key: String,
    token: CancellationToken,
    join: JoinHandle<()>,
}

/// Keeps only the most recent inner sequence alive.
///
/// A new key cancels the running inner task and waits for it to stop before
/// the replacement starts, so nothing from a superseded key reaches the
/// observer afterwards.
#[derive(Default)]
pub struct Latest {
    generation: u64,
    current: Option<Current>,
}

impl Latest {
    /// Creates a switch-to-latest strategy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn cancel_current(&mut self) {
        if let Some(current) = self.current.take() {
            current.token.cancel();
            current.join.await;
            debug!(key = %current.key, "superseded inner sequence stopped");
        }
    }
}

impl fmt::Debug for Latest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Latest")
            .field("generation", &self.generation)
            .field("current", &self.current.as_ref().map(|c| c.key.as_str()))
            .finish()
    }
}

impl<V: 'static> FlattenStrategy<V> for Latest {
    fn name(&self) -> &'static str {
        "latest"
    }

    fn on_outer_key<'a>(
        &'a mut self,
        ctx: &'a FlattenContext<V>,
        key: String,
        inner: InnerSequence<V>,
    ) -> LocalBoxFuture<'a, HotflowResult<()>> {
        async move {
            self.cancel_current().await;
            self.generation += 1;
            ctx.tracker.discard_before(self.generation);

            let token = CancellationToken::new();
            let join = ctx.spawn(key.clone(), inner, token.clone(), self.generation);
            self.current = Some(Current { key, token, join });
            Ok(())
        }
        .boxed_local()
    }

    fn finish<'a>(&'a mut self, _ctx: &'a FlattenContext<V>) -> LocalBoxFuture<'a, ()> {
        async move {
            if let Some(current) = self.current.take() {
                current.join.await;
            }
        }
        .boxed_local()
    }

    fn abort<'a>(&'a mut self, _ctx: &'a FlattenContext<V>) -> LocalBoxFuture<'a, ()> {
        self.cancel_current().boxed_local()
    }
}

/// Strategy selector for config-driven wiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlattenKind {
    /// [`Concat`].
    #[default]
    Concat,
    /// [`Merge`].
    Merge,
    /// [`Latest`].
    Latest,
}

impl FlattenKind {
    /// Builds the selected strategy.
    pub fn build<V: 'static>(self, merge: MergeConfig) -> Result<Box<dyn FlattenStrategy<V>>, ValidationError> {
        Ok(match self {
            Self::Concat => Box::new(Concat),
            Self::Merge => Box::new(Merge::new(merge)?),
            Self::Latest => Box::new(Latest::new()),
        })
    }
}

impl fmt::Display for FlattenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Concat => write!(f, "concat"),
            Self::Merge => write!(f, "merge"),
            Self::Latest => write!(f, "latest"),
        }
    }
}
