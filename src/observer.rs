//! Downstream consumers of a combinator's output.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::debug;

/// Receives output values one at a time, in order.
///
/// There is no way to push back: an observer that cannot keep up must buffer
/// or drop on its own (see [`ChannelObserver`]).
pub trait Observer<V> {
    /// Called once per output value.
    fn on_next(&mut self, value: V);
}

impl<V, F> Observer<V> for F
where
    F: FnMut(V),
{
    fn on_next(&mut self, value: V) {
        self(value);
    }
}

/// Collects every value into a shared vector.
///
/// Clones share the same vector, so a test can keep one clone and hand the
/// other to a combinator.
pub struct RecordingObserver<V> {
    values: Arc<Mutex<Vec<V>>>,
}

impl<V> RecordingObserver<V> {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            values: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Number of values recorded so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes the recorded values, leaving the recorder empty.
    #[must_use]
    pub fn take(&self) -> Vec<V> {
        std::mem::take(&mut *self.values.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl<V: Clone> RecordingObserver<V> {
    /// Copy of the values recorded so far.
    #[must_use]
    pub fn values(&self) -> Vec<V> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl<V> Default for RecordingObserver<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Clone for RecordingObserver<V> {
    fn clone(&self) -> Self {
        Self {
            values: Arc::clone(&self.values),
        }
    }
}

impl<V> Observer<V> for RecordingObserver<V> {
    fn on_next(&mut self, value: V) {
        self.values.lock().unwrap_or_else(PoisonError::into_inner).push(value);
    }
}

impl<V> fmt::Debug for RecordingObserver<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingObserver").field("len", &self.len()).finish()
    }
}

/// Forwards values into a bounded queue read by another thread.
///
/// Never blocks the scheduler: when the queue is full or the receiver is gone
/// the value is dropped and counted.
#[derive(Debug)]
pub struct ChannelObserver<V> {
    tx: Sender<V>,
    dropped: Arc<AtomicU64>,
}

impl<V> ChannelObserver<V> {
    /// Creates an observer and the receiving end of its queue.
    #[must_use]
    pub fn bounded(capacity: usize) -> (Self, Receiver<V>) {
        let (tx, rx) = bounded(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Values discarded because the queue was full or disconnected.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Shared drop counter, readable after the observer moved into a task.
    #[must_use]
    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }
}

impl<V> Observer<V> for ChannelObserver<V> {
    fn on_next(&mut self, value: V) {
        match self.tx.try_send(value) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(capacity = ?self.tx.capacity(), "observer queue full, dropped value");
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_observer_clones_share_values() {
        let recorder = RecordingObserver::new();
        let mut sink = recorder.clone();
        sink.on_next("A_1");
        sink.on_next("A_2");

        assert_eq!(recorder.values(), vec!["A_1", "A_2"]);
        assert_eq!(recorder.take(), vec!["A_1", "A_2"]);
        assert!(recorder.is_empty());
    }

    #[test]
    fn closure_is_an_observer() {
        let mut seen = Vec::new();
        {
            let mut observer = |v: u32| seen.push(v);
            observer.on_next(1);
            observer.on_next(2);
        }
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn channel_observer_drops_when_full() {
        let (mut observer, rx) = ChannelObserver::bounded(1);
        observer.on_next(1);
        observer.on_next(2);
        assert_eq!(observer.dropped(), 1);
        assert_eq!(rx.try_recv().unwrap(), 1);

        drop(rx);
        observer.on_next(3);
        assert_eq!(observer.dropped(), 2);
    }
}
