//! # hotflow - Hot broadcast streams and flattening combinators
//!
//! hotflow models how a producer, a shared bounded buffer and concurrent
//! consumers interact, on a deterministic logical clock. Every run with the
//! same inputs produces the same output order.
//!
//! ## Core Concepts
//!
//! - **HotStream**: a multi-subscriber broadcast channel with an optional
//!   replay slot, a per-subscriber buffer and an overflow policy
//! - **Subscriber**: an independent read cursor into a hot stream
//! - **Publisher**: paced driver that publishes a fixed sequence
//! - **FlatteningCombinator**: turns keys into inner sequences and
//!   re-linearizes them with the Concat, Merge or Latest strategy
//! - **Scheduler**: single-threaded executor whose clock jumps between timers
//!
//! ## Usage
//!
//! ```rust
//! use hotflow::{
//!     paced_sequence, FlatteningCombinator, HotStream, HotStreamConfig, HotflowResult, InnerSequence,
//!     Publisher, PublisherConfig, RecordingObserver, Scheduler,
//! };
//!
//! let mut scheduler = Scheduler::new();
//! let handle = scheduler.handle();
//!
//! let keys = HotStream::new(HotStreamConfig::default())?;
//! let h = handle.clone();
//! let factory = move |key: &String| -> HotflowResult<InnerSequence<String>> {
//!     let values = (1..=3).map(|i| format!("{key}_{i}")).collect();
//!     Ok(paced_sequence(h.clone(), 500, values))
//! };
//! let latest = FlatteningCombinator::latest(keys.subscribe(), factory, handle.clone());
//!
//! let publisher = Publisher::new(keys, handle.clone(), PublisherConfig::default());
//! handle.spawn(publisher.run(["A", "B", "C"].map(String::from)));
//!
//! let output = RecordingObserver::new();
//! scheduler.block_on(latest.run(output.clone()))??;
//! assert_eq!(output.values(), ["C_1", "C_2", "C_3"]);
//! # Ok::<(), hotflow::HotflowError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Value types and errors
pub mod config;
pub mod error;
pub mod observer;
pub mod policy;

// Execution substrate
pub mod scheduler;

// Streams and combinators
pub mod flatten;
pub mod stream;

// Re-export primary types at crate root for convenience
pub use config::HotflowConfig;
pub use error::{ConfigError, ExecutionError, HotflowError, HotflowResult, StreamError, ValidationError};
pub use flatten::{
    paced_sequence, Concat, FlattenKind, FlattenStrategy, FlatteningCombinator, InnerSequence, InnerStreamFactory,
    Latest, Merge, MergeConfig,
};
pub use observer::{ChannelObserver, Observer, RecordingObserver};
pub use policy::{HotStreamConfig, OverflowPolicy, ReplayConfig};
pub use scheduler::{
    yield_now, CancellationToken, JoinHandle, RunReport, Scheduler, SchedulerConfig, SchedulerHandle, Ticks,
};
pub use stream::{HotStream, PublishReport, Publisher, PublisherConfig, SharedStream, StreamStats, Subscriber, SubscriberId};
