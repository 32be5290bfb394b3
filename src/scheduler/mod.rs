//! Deterministic cooperative scheduling.
//!
//! Every suspension point in hotflow (a suspended publish, a reader waiting
//! for a value, a synthetic delay inside an inner sequence) is a future polled
//! by this executor. Time is logical: the clock only moves when every ready
//! task has run, and then jumps to the next timer deadline.

/// Cancellation tokens.
pub mod cancel;
/// Task table, ready queue and run loops.
pub mod executor;
/// Logical clock futures.
pub mod time;

pub use cancel::{CancellationToken, Cancelled};
pub use executor::{JoinHandle, RunReport, Scheduler, SchedulerConfig, SchedulerHandle, TaskId};
pub use time::{yield_now, Sleep, Ticks, YieldNow};
