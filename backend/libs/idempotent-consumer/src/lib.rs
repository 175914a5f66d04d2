//! # Idempotent Consumer Library
//!
//! Suppresses duplicate business effects under at-least-once delivery. A
//! time-bounded ledger records every event identifier whose effect has been
//! applied; a consumer that sees the identifier again within the
//! time-to-live skips the effect but still acknowledges the delivery.
//!
//! ## Problem
//!
//! The queue redelivers whenever a consumer crashes between claim and
//! acknowledge, and producers may submit the same event twice:
//! - **Crash mid-batch**: entries reappear after the visibility timeout
//! - **Producer retries**: the ingestion endpoint does not deduplicate
//! - **Several consumers**: two instances may hold entries for the same event
//!
//! ## Solution
//!
//! A ledger shared by every consumer instance:
//! - **Time-based expiry**: records expire after a configured TTL, never by size
//! - **Shared**: backed by the broker, not by process memory
//! - **Check, apply, record**: the effect runs only when the identifier is absent
//!
//! ## Architecture
//!
//! ```text
//! Queue → Consumer → IdempotencyGuard → Business Effect
//!                         ↓
//!                   (contains/record)
//!                         ↓
//!               Redis: {ns}:idempotency:{event_id}  (SET NX EX ttl)
//! ```
//!
//! ## Usage Example
//!
//! ```ignore
//! use idempotent_consumer::{IdempotencyGuard, InMemoryLedger, ProcessingResult};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let guard = IdempotencyGuard::new(Arc::new(InMemoryLedger::new()), Duration::from_secs(86400));
//!
//! match guard.process_if_new("event-123", || async {
//!     apply_effect().await
//! }).await? {
//!     ProcessingResult::Success => println!("Processed"),
//!     ProcessingResult::AlreadyProcessed => println!("Skipped duplicate"),
//!     ProcessingResult::Failed(err) => eprintln!("Effect failed: {}", err),
//! }
//! # Ok(())
//! # }
//! # async fn apply_effect() -> Result<(), std::io::Error> { Ok(()) }
//! ```
//!
//! ## Choosing the TTL
//!
//! The TTL must cover the longest plausible redelivery window: the visibility
//! timeout times the retry budget plus the producer's own retry horizon. The
//! default of 24 hours is generous for a queue drained in seconds.
//!
//! ## Concurrency
//!
//! `record` uses `SET NX`, so when two consumers apply the effect for the same
//! identifier concurrently only the first record wins and the second is
//! reported as a concurrent duplicate in the logs. The check-then-apply window
//! is the residual at-least-once exposure; it only opens when two entries for
//! the same identifier are claimed at the same moment.

use async_trait::async_trait;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

mod error;
mod memory;
mod redis_ledger;

pub use error::{IdempotencyError, IdempotencyResult};
pub use memory::InMemoryLedger;
pub use redis_ledger::RedisLedger;

/// Maximum event identifier length accepted by the ledger
pub const MAX_EVENT_ID_LEN: usize = 255;

/// Result of processing an event with idempotency check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingResult<E> {
    /// Event was processed successfully (first time)
    Success,

    /// Event was already processed before (duplicate)
    AlreadyProcessed,

    /// The business effect returned an error; nothing was recorded
    Failed(E),
}

/// Time-bounded set of processed event identifiers.
///
/// Implementations must be visible to every consumer instance.
#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    /// Record `event_id` as processed, expiring after `ttl`.
    ///
    /// Returns `true` when this call created the record and `false` when an
    /// unexpired record already existed (the original timestamp is kept).
    async fn record(&self, event_id: &str, ttl: Duration) -> IdempotencyResult<bool>;

    /// Whether an unexpired record exists for `event_id`.
    async fn contains(&self, event_id: &str) -> IdempotencyResult<bool>;
}

/// Idempotency guard for queue event processing
///
/// Cheap to clone; share one per consumer instance.
#[derive(Clone)]
pub struct IdempotencyGuard {
    ledger: Arc<dyn IdempotencyLedger>,
    ttl: Duration,
}

impl IdempotencyGuard {
    /// Create a new idempotency guard
    ///
    /// # Arguments
    ///
    /// * `ledger` - Shared ledger backend
    /// * `ttl` - How long a processed identifier suppresses reprocessing
    pub fn new(ledger: Arc<dyn IdempotencyLedger>, ttl: Duration) -> Self {
        Self { ledger, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Check if an event has already been processed
    pub async fn is_processed(&self, event_id: &str) -> IdempotencyResult<bool> {
        Self::validate_event_id(event_id)?;

        let exists = self.ledger.contains(event_id).await?;
        if exists {
            debug!(event_id = %event_id, "Event already processed");
        }

        Ok(exists)
    }

    /// Mark an event as processed
    ///
    /// # Returns
    ///
    /// - `Ok(true)` if event was marked as processed (first time)
    /// - `Ok(false)` if another consumer recorded it first
    pub async fn mark_processed(&self, event_id: &str) -> IdempotencyResult<bool> {
        Self::validate_event_id(event_id)?;

        let was_inserted = self.ledger.record(event_id, self.ttl).await?;

        if was_inserted {
            info!(
                event_id = %event_id,
                ttl_secs = self.ttl.as_secs(),
                "Event marked as processed"
            );
        } else {
            warn!(
                event_id = %event_id,
                "Event was recorded concurrently by another consumer"
            );
        }

        Ok(was_inserted)
    }

    /// Process event only if it hasn't been processed before
    ///
    /// 1. Check the ledger for `event_id`
    /// 2. If absent, run `f`
    /// 3. On success, record `event_id` with the guard's TTL
    ///
    /// A ledger failure during the check is returned as `Err` and `f` is not
    /// run. A ledger failure while recording after `f` succeeded is logged and
    /// reported as `Success`: the effect has happened and must be acknowledged,
    /// only the protection against a later redelivery is lost.
    pub async fn process_if_new<F, Fut, E>(
        &self,
        event_id: &str,
        f: F,
    ) -> IdempotencyResult<ProcessingResult<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        if self.is_processed(event_id).await? {
            return Ok(ProcessingResult::AlreadyProcessed);
        }

        match f().await {
            Ok(()) => {
                if let Err(e) = self.mark_processed(event_id).await {
                    warn!(
                        event_id = %event_id,
                        error = %e,
                        "Effect applied but ledger record failed; redelivery would not be deduplicated"
                    );
                }
                Ok(ProcessingResult::Success)
            }
            Err(e) => {
                warn!(
                    event_id = %event_id,
                    error = %e,
                    "Event processing failed"
                );
                Ok(ProcessingResult::Failed(e))
            }
        }
    }

    /// Validate event_id format
    pub fn validate_event_id(event_id: &str) -> IdempotencyResult<()> {
        if event_id.is_empty() {
            return Err(IdempotencyError::InvalidEventId(
                "Event ID cannot be empty".to_string(),
            ));
        }

        if event_id.len() > MAX_EVENT_ID_LEN {
            return Err(IdempotencyError::InvalidEventId(format!(
                "Event ID too long: {} characters (max {})",
                event_id.len(),
                MAX_EVENT_ID_LEN
            )));
        }

        Ok(())
    }
}
