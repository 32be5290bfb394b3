use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::HotflowResult;

use super::hot::Shared;

/// Unique identifier for a subscriber.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    /// Create a new random subscriber id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A read cursor into a hot stream.
///
/// Each subscriber has its own pending queue. Dropping the subscriber detaches
/// it; other subscribers and the publisher are unaffected.
pub struct Subscriber<T> {
    id: SubscriberId,
    shared: Arc<Shared<T>>,
}

impl<T> Subscriber<T> {
    pub(crate) fn new(id: SubscriberId, shared: Arc<Shared<T>>) -> Self {
        Self { id, shared }
    }

    /// The subscriber's id.
    #[must_use]
    pub const fn id(&self) -> SubscriberId {
        self.id
    }

    /// Values buffered for this subscriber and not read yet.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.pending(self.id)
    }

    /// Waits for the next value.
    ///
    /// Fails with [`StreamError::SubscriptionClosed`](crate::error::StreamError::SubscriptionClosed) once the stream is
    /// closed and nothing is pending.
    pub fn next(&mut self) -> Next<'_, T> {
        Next {
            subscriber: self,
            parked: false,
        }
    }

    /// Takes the next value if one is pending.
    pub fn try_next(&mut self) -> HotflowResult<Option<T>> {
        match self.shared.poll_next(self.id, None) {
            Poll::Ready(Ok(value)) => Ok(Some(value)),
            Poll::Ready(Err(err)) => Err(err),
            Poll::Pending => Ok(None),
        }
    }

    /// Detaches from the stream, discarding pending values.
    pub fn detach(self) {
        drop(self);
    }
}

impl<T> Drop for Subscriber<T> {
    fn drop(&mut self) {
        self.shared.detach(self.id);
    }
}

impl<T> fmt::Debug for Subscriber<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber").field("id", &self.id).finish()
    }
}

/// Future returned by [`Subscriber::next`].
///
/// Dropping it while pending withdraws the reader, so a rendezvous publish no
/// longer treats it as ready to receive.
#[must_use = "futures do nothing unless awaited"]
pub struct Next<'a, T> {
    subscriber: &'a mut Subscriber<T>,
    parked: bool,
}

impl<T> Future for Next<'_, T> {
    type Output = HotflowResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let id = self.subscriber.id;
        let polled = self.subscriber.shared.poll_next(id, Some(cx.waker()));
        self.parked = polled.is_pending();
        polled
    }
}

impl<T> Drop for Next<'_, T> {
    fn drop(&mut self) {
        if self.parked {
            self.subscriber.shared.unpark(self.subscriber.id);
        }
    }
}

impl<T> fmt::Debug for Next<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next").field("subscriber", &self.subscriber.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::policy::{HotStreamConfig, OverflowPolicy};
    use crate::scheduler::Scheduler;
    use crate::stream::HotStream;

    #[test]
    fn subscribers_read_independently() {
        let s = HotStream::new(HotStreamConfig::new(0, 4, OverflowPolicy::Suspend)).unwrap();
        let mut a = s.subscribe();
        let mut b = s.subscribe();
        assert_ne!(a.id(), b.id());

        s.try_publish(1).unwrap();
        s.try_publish(2).unwrap();

        assert_eq!(a.try_next().unwrap(), Some(1));
        assert_eq!(a.try_next().unwrap(), Some(2));
        assert_eq!(b.pending(), 2);
        assert_eq!(b.try_next().unwrap(), Some(1));
    }

    #[test]
    fn detach_leaves_other_subscribers_alone() {
        let s = HotStream::new(HotStreamConfig::new(0, 4, OverflowPolicy::Suspend)).unwrap();
        let a = s.subscribe();
        let mut b = s.subscribe();
        a.detach();
        assert_eq!(s.subscriber_count(), 1);

        s.try_publish("x").unwrap();
        assert_eq!(b.try_next().unwrap(), Some("x"));
    }

    #[test]
    fn next_waits_for_publish() {
        let mut scheduler = Scheduler::new();
        let handle = scheduler.handle();
        let s = HotStream::new(HotStreamConfig::default()).unwrap();
        let mut sub = s.subscribe();

        let h = handle.clone();
        let reader = handle.spawn(async move {
            let v = sub.next().await.unwrap();
            (v, h.now())
        });

        let h = handle.clone();
        scheduler
            .block_on(async {
                h.sleep(40).await;
                s.publish("late").await.unwrap();
            })
            .unwrap();

        assert_eq!(scheduler.block_on(reader).unwrap(), ("late", 40));
    }

    #[test]
    fn abandoned_next_is_not_a_rendezvous_target() {
        let mut scheduler = Scheduler::new();
        let s = HotStream::new(HotStreamConfig::default()).unwrap();
        let mut sub = s.subscribe();

        scheduler
            .block_on(async {
                let mut next = Box::pin(sub.next());
                assert!(futures::poll!(next.as_mut()).is_pending());
            })
            .unwrap();

        // Nobody is waiting any more, so a rendezvous publish has to suspend.
        scheduler
            .block_on(async {
                let mut publish = Box::pin(s.publish("x"));
                assert!(futures::poll!(publish.as_mut()).is_pending());
            })
            .unwrap();
        assert_eq!(sub.pending(), 0);
    }
}
