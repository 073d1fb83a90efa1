//! Error types for the relay library

use thiserror::Error;

/// Convenience result alias used throughout the crate
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors produced by the relay library
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// Invalid configuration supplied at construction time
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A barrier wait was interrupted by an alert. This is a recoverable
    /// control signal used for cancellation and termination checks, never a
    /// failure surfaced to user code.
    #[error("wait aborted by alert")]
    Alerted,

    /// A non-blocking claim found the ring full
    #[error("insufficient capacity in ring buffer")]
    InsufficientCapacity,

    /// `request(n)` was called with a non-positive demand
    #[error("invalid demand: request of {0} must be positive")]
    InvalidDemand(i64),

    /// A consumer task was started while it was already running
    #[error("consumer task is already running")]
    AlreadyRunning,

    /// The executor has been shut down and accepts no further tasks
    #[error("executor is shut down")]
    ExecutorShutDown,

    /// The executor rejected a task for a reason other than shutdown
    #[error("task rejected: {0}")]
    Rejected(String),

    /// Failure raised by a subscriber callback
    #[error("subscriber failure: {0}")]
    Subscriber(String),

    /// Internal state violation
    #[error("unexpected state: {0}")]
    Unexpected(String),
}

impl RelayError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a subscriber callback error
    pub fn subscriber(msg: impl Into<String>) -> Self {
        Self::Subscriber(msg.into())
    }

    /// Create an unexpected-state error
    pub fn unexpected(msg: impl Into<String>) -> Self {
        Self::Unexpected(msg.into())
    }

    /// Whether this error is a recoverable control signal rather than a failure
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Alerted)
    }

    /// Whether this error is the "executor shut down" rejection kind
    pub fn is_shutdown_rejection(&self) -> bool {
        matches!(self, Self::ExecutorShutDown)
    }
}
