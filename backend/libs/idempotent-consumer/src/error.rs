//! Error types for idempotent consumer library

use thiserror::Error;

/// Result type for idempotency operations
pub type IdempotencyResult<T> = Result<T, IdempotencyError>;

/// Errors that can occur while consulting or updating the ledger
#[derive(Error, Debug)]
pub enum IdempotencyError {
    /// Broker operation failed (connection, timeout, command error)
    #[error("Ledger backend error: {0}")]
    Backend(#[from] redis::RedisError),

    /// Event ID validation failed (empty, too long)
    #[error("Invalid event ID: {0}")]
    InvalidEventId(String),

    /// Time-to-live is zero or not representable
    #[error("Invalid time-to-live: {0}")]
    InvalidTtl(String),

    /// Generic error with context
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl IdempotencyError {
    /// Check if error is transient (should retry)
    ///
    /// Broker failures are transient; malformed identifiers and TTLs are not.
    pub fn is_transient(&self) -> bool {
        match self {
            IdempotencyError::Backend(redis_err) => {
                redis_err.is_io_error()
                    || redis_err.is_timeout()
                    || redis_err.is_connection_dropped()
                    || redis_err.is_connection_refusal()
            }
            IdempotencyError::Other(_) => true,
            IdempotencyError::InvalidEventId(_) | IdempotencyError::InvalidTtl(_) => false,
        }
    }
}
