//! Buffer behaviour descriptors for hot streams.
//!
//! These are plain values; all buffering logic lives in [`crate::stream`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// What a publish does when a subscriber's pending buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Suspend the publishing task until every subscriber has room.
    #[default]
    Suspend,
    /// Discard the oldest pending value to make room for the new one.
    DropOldest,
    /// Discard the value being published.
    DropLatest,
}

impl OverflowPolicy {
    /// Returns true for the policies that never suspend the publisher.
    #[must_use]
    pub const fn is_drop(self) -> bool {
        matches!(self, Self::DropOldest | Self::DropLatest)
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Suspend => "suspend",
            Self::DropOldest => "drop_oldest",
            Self::DropLatest => "drop_latest",
        };
        f.write_str(s)
    }
}

/// Replay and transient buffer sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// `1` keeps the last published value for future subscribers, `0` keeps nothing.
    pub replay_size: usize,
    /// Extra slots per attached subscriber for values awaiting delivery.
    pub extra_buffer_capacity: usize,
}

impl ReplayConfig {
    /// Pending values a single subscriber may hold before the overflow policy applies.
    #[must_use]
    pub const fn buffer_capacity(&self) -> usize {
        self.replay_size + self.extra_buffer_capacity
    }
}

/// Full configuration of a [`HotStream`](crate::stream::HotStream).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HotStreamConfig {
    /// Replay and buffer sizing.
    pub replay: ReplayConfig,
    /// Behaviour on a full subscriber buffer.
    pub overflow: OverflowPolicy,
}

impl HotStreamConfig {
    /// Creates a config from its parts.
    #[must_use]
    pub const fn new(replay_size: usize, extra_buffer_capacity: usize, overflow: OverflowPolicy) -> Self {
        Self {
            replay: ReplayConfig {
                replay_size,
                extra_buffer_capacity,
            },
            overflow,
        }
    }

    /// A state stream: keeps only the latest value and never suspends.
    #[must_use]
    pub const fn state() -> Self {
        Self::new(1, 0, OverflowPolicy::DropOldest)
    }

    /// Checks the sizing rules.
    ///
    /// A drop policy needs at least one slot to drop from, so it is rejected
    /// when both replay and extra capacity are zero.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.replay.replay_size > 1 {
            return Err(ValidationError::ReplaySizeOutOfRange {
                value: self.replay.replay_size,
            });
        }
        if self.overflow.is_drop() && self.replay.buffer_capacity() == 0 {
            return Err(ValidationError::DropPolicyWithoutBuffer {
                policy: self.overflow.to_string(),
            });
        }
        Ok(())
    }
}
