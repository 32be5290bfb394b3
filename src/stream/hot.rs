//! The hot broadcast stream.
//!
//! A [`HotStream`] pushes every published value into the pending queue of each
//! attached [`Subscriber`]. Queues are bounded by
//! `replay_size + extra_buffer_capacity`; a subscriber that is currently
//! suspended in `next()` takes the value by hand-off instead. When a queue is
//! full the configured [`OverflowPolicy`] decides between suspending the
//! publisher and dropping a value for that subscriber.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use serde::Serialize;
use tracing::debug;

use crate::error::{HotflowResult, StreamError, ValidationError};
use crate::policy::{HotStreamConfig, OverflowPolicy};

use super::subscriber::{Subscriber, SubscriberId};

/// Counters for buffer-management outcomes.
///
/// Drops and suspensions are normal behaviour, never errors; this is the only
/// place they are observable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    /// Publishes accepted by the stream. A suspending publish counts from its
    /// first poll, so one dropped while suspended is counted here but never
    /// delivered.
    pub published: u64,
    /// Values placed into a subscriber's queue or handed off by a publish.
    /// The replay value handed to a subscriber on attach is not counted.
    pub delivered: u64,
    /// Pending values discarded by `DropOldest`.
    pub dropped_oldest: u64,
    /// Published values discarded by `DropLatest`.
    pub dropped_latest: u64,
    /// Publishes that had to wait for capacity.
    pub suspensions: u64,
    /// `try_publish` calls refused for lack of capacity.
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped_oldest: AtomicU64,
    dropped_latest: AtomicU64,
    suspensions: AtomicU64,
    rejected: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> StreamStats {
        StreamStats {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped_oldest: self.dropped_oldest.load(Ordering::Relaxed),
            dropped_latest: self.dropped_latest.load(Ordering::Relaxed),
            suspensions: self.suspensions.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
struct Slot<T> {
    id: SubscriberId,
    attached_at: u64,
    pending: VecDeque<T>,
    parked: Option<Waker>,
}

impl<T> Slot<T> {
    fn has_room(&self, capacity: usize) -> bool {
        self.parked.is_some() || self.pending.len() < capacity
    }
}

#[derive(Debug)]
struct State<T> {
    replay: Option<T>,
    subscribers: Vec<Slot<T>>,
    next_attach: u64,
    suspended: VecDeque<(u64, Waker)>,
    next_ticket: u64,
    closed: bool,
}

impl<T> State<T> {
    fn slot_mut(&mut self, id: SubscriberId) -> Option<&mut Slot<T>> {
        self.subscribers.iter_mut().find(|s| s.id == id)
    }

    /// Subscribers that were attached when a publish with this horizon started.
    fn targets(&self, horizon: u64) -> impl Iterator<Item = &Slot<T>> {
        self.subscribers.iter().filter(move |s| s.attached_at < horizon)
    }

    fn all_have_room(&self, horizon: u64, capacity: usize) -> bool {
        self.targets(horizon).all(|s| s.has_room(capacity))
    }

    /// Buffer space only; a parked reader is not room for a non-suspending publish.
    fn all_have_buffer_room(&self, horizon: u64, capacity: usize) -> bool {
        self.targets(horizon).all(|s| s.pending.len() < capacity)
    }

    fn wake_next_publisher(&self) {
        if let Some((_, waker)) = self.suspended.front() {
            waker.wake_by_ref();
        }
    }
}

impl<T: Clone> State<T> {
    fn deliver(&mut self, value: T, horizon: u64, config: &HotStreamConfig, counters: &Counters) {
        let capacity = config.replay.buffer_capacity();
        for slot in self.subscribers.iter_mut().filter(|s| s.attached_at < horizon) {
            if let Some(waker) = slot.parked.take() {
                slot.pending.push_back(value.clone());
                waker.wake();
                counters.delivered.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if slot.pending.len() < capacity {
                slot.pending.push_back(value.clone());
                counters.delivered.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            match config.overflow {
                OverflowPolicy::DropOldest => {
                    slot.pending.pop_front();
                    slot.pending.push_back(value.clone());
                    counters.dropped_oldest.fetch_add(1, Ordering::Relaxed);
                    counters.delivered.fetch_add(1, Ordering::Relaxed);
                    debug!(subscriber = %slot.id, "pending buffer full, dropped oldest value");
                }
                OverflowPolicy::DropLatest => {
                    counters.dropped_latest.fetch_add(1, Ordering::Relaxed);
                    debug!(subscriber = %slot.id, "pending buffer full, dropped published value");
                }
                OverflowPolicy::Suspend => {
                    // Room was checked by the caller; never lose a value here.
                    slot.pending.push_back(value.clone());
                    counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

pub(crate) struct Shared<T> {
    config: HotStreamConfig,
    state: Mutex<State<T>>,
    counters: Counters,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn unpark(&self, id: SubscriberId) {
        let mut state = self.lock();
        if let Some(slot) = state.slot_mut(id) {
            slot.parked = None;
        }
    }

    pub(crate) fn detach(&self, id: SubscriberId) {
        let mut state = self.lock();
        let before = state.subscribers.len();
        state.subscribers.retain(|s| s.id != id);
        if state.subscribers.len() != before {
            debug!(subscriber = %id, remaining = state.subscribers.len(), "subscriber detached");
            state.wake_next_publisher();
        }
    }

    pub(crate) fn pending(&self, id: SubscriberId) -> usize {
        self.lock().slot_mut(id).map_or(0, |s| s.pending.len())
    }

    /// Takes the next value for `id`, or parks the reader.
    pub(crate) fn poll_next(&self, id: SubscriberId, waker: Option<&Waker>) -> Poll<HotflowResult<T>> {
        let mut state = self.lock();
        let closed = state.closed;
        let Some(slot) = state.slot_mut(id) else {
            return Poll::Ready(Err(StreamError::SubscriptionClosed.into()));
        };

        if let Some(value) = slot.pending.pop_front() {
            slot.parked = None;
            state.wake_next_publisher();
            return Poll::Ready(Ok(value));
        }
        if closed {
            slot.parked = None;
            return Poll::Ready(Err(StreamError::SubscriptionClosed.into()));
        }
        let Some(waker) = waker else {
            return Poll::Pending;
        };
        slot.parked = Some(waker.clone());
        // A parked reader counts as room for a rendezvous publish.
        state.wake_next_publisher();
        Poll::Pending
    }
}

impl<T: Clone> Shared<T> {
    fn subscribe(self: &Arc<Self>) -> Subscriber<T> {
        let mut state = self.lock();
        let id = SubscriberId::new();
        let attached_at = state.next_attach;
        state.next_attach += 1;

        let mut pending = VecDeque::with_capacity(self.config.replay.buffer_capacity());
        if let Some(value) = state.replay.clone() {
            pending.push_back(value);
        }
        let replayed = !pending.is_empty();
        state.subscribers.push(Slot {
            id,
            attached_at,
            pending,
            parked: None,
        });
        debug!(subscriber = %id, replayed, total = state.subscribers.len(), "subscriber attached");
        drop(state);

        Subscriber::new(id, Arc::clone(self))
    }

    fn try_publish(&self, value: T) -> HotflowResult<bool> {
        let mut state = self.lock();
        if state.closed {
            return Err(StreamError::PublishAfterClose.into());
        }
        let horizon = state.next_attach;
        if self.config.overflow == OverflowPolicy::Suspend
            && (!state.suspended.is_empty()
                || !state.all_have_buffer_room(horizon, self.config.replay.buffer_capacity()))
        {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }

        if self.config.replay.replay_size == 1 {
            state.replay = Some(value.clone());
        }
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        state.deliver(value, horizon, &self.config, &self.counters);
        Ok(true)
    }

    fn close(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        for slot in &mut state.subscribers {
            if let Some(waker) = slot.parked.take() {
                waker.wake();
            }
        }
        for (_, waker) in state.suspended.drain(..) {
            waker.wake();
        }
        debug!(subscribers = state.subscribers.len(), "stream closed");
    }
}

/// Write side of a hot broadcast stream.
///
/// Not `Clone`: whoever owns it has exclusive write access. Readers obtain a
/// [`SharedStream`] through [`share`](Self::share).
pub struct HotStream<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Clone> HotStream<T> {
    /// Creates a stream with a validated config.
    pub fn new(config: HotStreamConfig) -> Result<Self, ValidationError> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(State {
                    replay: None,
                    subscribers: Vec::new(),
                    next_attach: 0,
                    suspended: VecDeque::new(),
                    next_ticket: 0,
                    closed: false,
                }),
                counters: Counters::default(),
            }),
        })
    }

    /// Creates a stream whose replay slot already holds `initial`.
    pub fn with_initial(config: HotStreamConfig, initial: T) -> Result<Self, ValidationError> {
        if config.replay.replay_size == 0 {
            return Err(ValidationError::InitialValueWithoutReplay);
        }
        let stream = Self::new(config)?;
        stream.shared.lock().replay = Some(initial);
        Ok(stream)
    }

    /// Publishes `value` to every attached subscriber.
    ///
    /// Under [`OverflowPolicy::Suspend`] the returned future stays pending until
    /// every subscriber attached at call time can take the value.
    pub fn publish(&self, value: T) -> Publish<'_, T> {
        Publish {
            shared: &self.shared,
            value: Some(value),
            horizon: None,
            ticket: None,
        }
    }

    /// Publishes without suspending.
    ///
    /// Returns `Ok(false)` when a `Suspend` stream has no buffer room; the value
    /// is then discarded as a whole and the replay slot is left untouched. A
    /// reader parked in `next()` is not room here, so on a stream without a
    /// buffer this always refuses while someone is subscribed.
    pub fn try_publish(&self, value: T) -> HotflowResult<bool> {
        self.shared.try_publish(value)
    }

    /// Attaches a new subscriber.
    pub fn subscribe(&self) -> Subscriber<T> {
        self.shared.subscribe()
    }

    /// Read-only view that can be cloned and handed to consumers.
    #[must_use]
    pub fn share(&self) -> SharedStream<T> {
        SharedStream {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Closes the stream.
    ///
    /// Pending values stay readable; afterwards readers get
    /// [`StreamError::SubscriptionClosed`] and publishers
    /// [`StreamError::PublishAfterClose`].
    pub fn close(&self) {
        self.shared.close();
    }

    /// The stream's configuration.
    #[must_use]
    pub fn config(&self) -> HotStreamConfig {
        self.shared.config
    }

    /// Snapshot of the replay slot.
    #[must_use]
    pub fn value(&self) -> Option<T> {
        self.shared.lock().replay.clone()
    }

    /// Number of attached subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.shared.lock().subscribers.len()
    }

    /// Returns true once [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Buffer-management counters.
    #[must_use]
    pub fn stats(&self) -> StreamStats {
        self.shared.counters.snapshot()
    }
}

impl<T> std::fmt::Debug for HotStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotStream").field("config", &self.shared.config).finish()
    }
}

/// Cloneable read-only handle to a [`HotStream`].
pub struct SharedStream<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Clone> SharedStream<T> {
    /// Attaches a new subscriber.
    pub fn subscribe(&self) -> Subscriber<T> {
        self.shared.subscribe()
    }

    /// The stream's configuration.
    #[must_use]
    pub fn config(&self) -> HotStreamConfig {
        self.shared.config
    }

    /// Snapshot of the replay slot.
    #[must_use]
    pub fn value(&self) -> Option<T> {
        self.shared.lock().replay.clone()
    }

    /// Number of attached subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.shared.lock().subscribers.len()
    }

    /// Returns true once the stream was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Buffer-management counters.
    #[must_use]
    pub fn stats(&self) -> StreamStats {
        self.shared.counters.snapshot()
    }
}

impl<T> Clone for SharedStream<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for SharedStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStream").field("config", &self.shared.config).finish()
    }
}

/// Future returned by [`HotStream::publish`].
#[must_use = "futures do nothing unless awaited"]
pub struct Publish<'a, T> {
    shared: &'a Shared<T>,
    value: Option<T>,
    horizon: Option<u64>,
    ticket: Option<u64>,
}

// The value is moved out, never pinned.
impl<T> Unpin for Publish<'_, T> {}

impl<T> Publish<'_, T> {
    fn leave_queue(&mut self, state: &mut State<T>) {
        let Some(ticket) = self.ticket.take() else {
            return;
        };
        let was_front = state.suspended.front().is_some_and(|(t, _)| *t == ticket);
        state.suspended.retain(|(t, _)| *t != ticket);
        if was_front {
            state.wake_next_publisher();
        }
    }
}

impl<T: Clone> Future for Publish<'_, T> {
    type Output = HotflowResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let shared = this.shared;
        let mut state = shared.lock();

        let Some(value) = this.value.as_ref() else {
            return Poll::Ready(Ok(()));
        };
        if state.closed {
            this.leave_queue(&mut state);
            this.value = None;
            return Poll::Ready(Err(StreamError::PublishAfterClose.into()));
        }

        let horizon = match this.horizon {
            Some(horizon) => horizon,
            None => {
                // Replay is written before any overflow decision.
                if shared.config.replay.replay_size == 1 {
                    state.replay = Some(value.clone());
                }
                shared.counters.published.fetch_add(1, Ordering::Relaxed);
                let horizon = state.next_attach;
                this.horizon = Some(horizon);
                horizon
            }
        };

        if shared.config.overflow == OverflowPolicy::Suspend {
            let first_in_line = state.suspended.front().map_or(true, |(t, _)| Some(*t) == this.ticket);
            if !first_in_line || !state.all_have_room(horizon, shared.config.replay.buffer_capacity()) {
                match this.ticket {
                    Some(ticket) => {
                        if let Some(entry) = state.suspended.iter_mut().find(|(t, _)| *t == ticket) {
                            entry.1 = cx.waker().clone();
                        }
                    }
                    None => {
                        let ticket = state.next_ticket;
                        state.next_ticket += 1;
                        state.suspended.push_back((ticket, cx.waker().clone()));
                        this.ticket = Some(ticket);
                        shared.counters.suspensions.fetch_add(1, Ordering::Relaxed);
                        debug!(queued = state.suspended.len(), "publish suspended until subscribers have room");
                    }
                }
                return Poll::Pending;
            }
            if this.ticket.take().is_some() {
                state.suspended.pop_front();
            }
        }

        let Some(value) = this.value.take() else {
            return Poll::Ready(Ok(()));
        };
        state.deliver(value, horizon, &shared.config, &shared.counters);
        state.wake_next_publisher();
        Poll::Ready(Ok(()))
    }
}

impl<T> Drop for Publish<'_, T> {
    fn drop(&mut self) {
        if self.ticket.is_some() {
            let mut state = self.shared.lock();
            self.leave_queue(&mut state);
        }
    }
}
