//! Error types for hotflow.
//!
//! All errors in hotflow are strongly typed using thiserror.
//! Buffer-management outcomes (drops, suspensions) are never errors; they are
//! counted in [`StreamStats`](crate::stream::StreamStats) instead.

use thiserror::Error;

/// Validation errors raised while building streams and configs.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Replay size {value} is out of range [0, 1]")]
    ReplaySizeOutOfRange {
        value: usize,
    },

    #[error("Overflow policy {policy} requires replay or extra buffer capacity")]
    DropPolicyWithoutBuffer {
        policy: String,
    },

    #[error("Initial value requires replay_size = 1")]
    InitialValueWithoutReplay,

    #[error("Merge concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("Poll budget must be at least 1")]
    ZeroPollBudget,
}

/// Errors surfaced by hot streams and their subscribers.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Subscription closed: stream is closed and no values are pending")]
    SubscriptionClosed,

    #[error("Cannot publish: stream is closed")]
    PublishAfterClose,
}

/// Execution errors raised by the scheduler and the combinators.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Inner sequence for key {key} failed: {reason}")]
    InnerSequenceFailure {
        key: String,
        reason: String,
    },

    #[error("Task was cancelled")]
    Cancelled,

    #[error("Scheduler stalled at tick {now} with {pending_tasks} pending task(s)")]
    Stalled {
        now: u64,
        pending_tasks: usize,
    },

    #[error("Scheduler poll budget of {max_polls} exhausted")]
    BudgetExhausted {
        max_polls: u64,
    },
}

/// Errors loading a configuration document.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse config: {message}")]
    Parse {
        message: String,
    },

    #[error("Invalid config: {0}")]
    Invalid(#[from] ValidationError),
}

/// Top-level error type for hotflow.
#[derive(Debug, Error)]
pub enum HotflowError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl HotflowError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates an inner sequence failure for `key`.
    #[must_use]
    pub fn inner_failure(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Execution(ExecutionError::InnerSequenceFailure {
            key: key.into(),
            reason: reason.into(),
        })
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a stream error.
    #[must_use]
    pub const fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if the subscription has reached its end.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Stream(StreamError::SubscriptionClosed))
    }

    /// Returns true if this error only reports a cancelled task.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Execution(ExecutionError::Cancelled))
    }
}

/// Result type alias for hotflow operations.
pub type HotflowResult<T> = Result<T, HotflowError>;
