//! Hot broadcast streams.
//!
//! A [`HotStream`] produces values whether or not anyone listens. Late
//! subscribers only see the replay slot (when configured) and what is
//! published after they attach.

/// Stream state, publish and close.
pub mod hot;
/// Paced publishing driver.
pub mod publisher;
/// Per-consumer cursors.
pub mod subscriber;

pub use hot::{HotStream, Publish, SharedStream, StreamStats};
pub use publisher::{PublishReport, Publisher, PublisherConfig};
pub use subscriber::{Next, Subscriber, SubscriberId};
