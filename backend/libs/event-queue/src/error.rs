//! Error types for the event queue library.

use thiserror::Error;

/// Result type alias for queue store operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors raised by a [`crate::QueueStore`].
///
/// Every variant is an infrastructure failure: the caller cannot tell whether
/// the broker applied the operation, so it must rely on the visibility timeout
/// and the idempotency ledger rather than assume either outcome.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Broker command failed (connection refused, timeout, script error)
    #[error("Broker error: {0}")]
    Broker(#[from] redis::RedisError),

    /// Entry could not be encoded for storage
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Broker is reachable in principle but currently refuses work
    #[error("Queue store unavailable: {0}")]
    Unavailable(String),

    /// Generic error with context
    #[error("Queue error: {0}")]
    Other(#[from] anyhow::Error),
}
