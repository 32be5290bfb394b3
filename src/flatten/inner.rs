//! The inner-sequence contract consumed by the combinators.

use futures::stream::{self, LocalBoxStream, StreamExt};

use crate::error::{ExecutionError, HotflowError, HotflowResult};
use crate::scheduler::{SchedulerHandle, Ticks};

/// A lazy, finite sequence derived from one outer key.
///
/// An `Err` item ends the sequence with a failure.
pub type InnerSequence<V> = LocalBoxStream<'static, HotflowResult<V>>;

/// Maps an outer key to a fresh inner sequence.
///
/// Every call must return a new sequence; combinators call `load` once per
/// key they receive.
pub trait InnerStreamFactory<K, V> {
    /// Builds the inner sequence for `key`.
    fn load(&self, key: &K) -> HotflowResult<InnerSequence<V>>;
}

impl<K, V, F> InnerStreamFactory<K, V> for F
where
    F: Fn(&K) -> HotflowResult<InnerSequence<V>>,
{
    fn load(&self, key: &K) -> HotflowResult<InnerSequence<V>> {
        self(key)
    }
}

/// Yields `values` in order, each one after `delay` logical ticks.
///
/// The delay starts when the element is requested, so a consumer that stops
/// pulling stops the clock for this sequence.
pub fn paced_sequence<V: 'static>(scheduler: SchedulerHandle, delay: Ticks, values: Vec<V>) -> InnerSequence<V> {
    stream::iter(values)
        .then(move |value| {
            let sleep = scheduler.sleep(delay);
            async move {
                sleep.await;
                Ok(value)
            }
        })
        .boxed_local()
}

/// Attaches the key to an error raised while loading or draining its sequence.
pub(crate) fn annotate(key: &str, err: HotflowError) -> HotflowError {
    match err {
        HotflowError::Execution(ExecutionError::InnerSequenceFailure { .. } | ExecutionError::Cancelled) => err,
        other => HotflowError::inner_failure(key, other.to_string()),
    }
}
