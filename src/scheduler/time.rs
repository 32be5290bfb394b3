use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use super::executor::{Core, TimerKey};

/// Logical time unit.
pub type Ticks = u64;

/// Completes once the scheduler clock reaches its deadline.
///
/// Created by [`SchedulerHandle::sleep`](super::SchedulerHandle::sleep).
/// Dropping a pending sleep removes its timer.
pub struct Sleep {
    core: Rc<Core>,
    deadline: Ticks,
    timer: Option<TimerKey>,
}

impl Sleep {
    pub(crate) fn new(core: Rc<Core>, deadline: Ticks) -> Self {
        Self {
            core,
            deadline,
            timer: None,
        }
    }

    /// Tick at which the sleep completes.
    #[must_use]
    pub const fn deadline(&self) -> Ticks {
        self.deadline
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.core.now() >= self.deadline {
            if let Some(key) = self.timer.take() {
                self.core.cancel_timer(key);
            }
            return Poll::Ready(());
        }
        match self.timer {
            Some(key) => self.core.refresh_timer(key, cx.waker()),
            None => {
                let key = self.core.register_timer(self.deadline, cx.waker().clone());
                self.timer = Some(key);
            }
        }
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(key) = self.timer.take() {
            self.core.cancel_timer(key);
        }
    }
}

impl fmt::Debug for Sleep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sleep").field("deadline", &self.deadline).finish()
    }
}

/// Requeues the current task behind every task that is already ready.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now`].
#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
