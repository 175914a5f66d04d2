//! # Event Queue
//!
//! Durable buffer between the ingestion endpoint and the batch consumer.
//!
//! The queue store is an external shared service reached through a narrow set
//! of atomic primitives, so any number of producers and consumer instances can
//! share it:
//!
//! - **append**: push an event to the tail of the live queue
//! - **claim**: move up to `n` entries from the head of the live queue into the
//!   in-flight marker with a visibility deadline
//! - **acknowledge**: drop entries from the in-flight marker (delivery ack)
//! - **requeue**: hand a failed entry back, optionally after a delay
//! - **dead_letter**: move an entry from the in-flight marker to the
//!   dead-letter buffer
//!
//! ## Delivery guarantees
//!
//! - **At-least-once**: a consumer that crashes between claim and
//!   acknowledge loses nothing; once the visibility deadline passes the next
//!   claim returns the entry to the live queue.
//! - **No global ordering**: entries are claimed head-first but retries and
//!   reclaimed entries rejoin at the tail.
//! - **Duplicates are possible**: consumers deduplicate through an
//!   idempotency ledger keyed by `event_id`.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_queue::{Event, InMemoryQueueStore, QueueStore};
//! use std::time::Duration;
//!
//! # async fn example(event: Event) -> Result<(), event_queue::QueueError> {
//! let store = InMemoryQueueStore::new();
//! store.append(event).await?;
//!
//! let batch = store.claim(10, Duration::from_secs(30)).await?;
//! let leases: Vec<_> = batch.iter().filter_map(|e| e.lease()).collect();
//! store.acknowledge(&leases).await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use std::time::Duration;

mod error;
mod memory;
mod model;
mod redis_store;

pub use error::{QueueError, QueueResult};
pub use memory::InMemoryQueueStore;
pub use model::{
    AttemptRecord, DeadLetterEntry, DeadLetterReason, Event, Lease, QueueStats, QueuedEvent,
    MAX_EVENT_ID_LEN,
};
pub use redis_store::{QueueKeys, RedisQueueStore};

/// Atomic operations on the shared queue store.
///
/// Implementations must make each method atomic with respect to concurrent
/// callers in other processes: two consumers calling [`QueueStore::claim`]
/// never receive the same entry while its visibility deadline is in the future.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Verify the store is reachable.
    async fn ping(&self) -> QueueResult<()>;

    /// Append an event to the tail of the live queue.
    ///
    /// Returns the stored entry; its `entry_id` is fresh even when the
    /// `event_id` has been seen before.
    async fn append(&self, event: Event) -> QueueResult<QueuedEvent>;

    /// Claim up to `max` entries for `visibility_timeout`.
    ///
    /// Before popping, due retry entries and entries whose visibility
    /// deadline has passed are returned to the tail of the live queue.
    /// Returns entries in claim order, each carrying a fresh lease token; an
    /// empty vector means nothing was available.
    async fn claim(
        &self,
        max: usize,
        visibility_timeout: Duration,
    ) -> QueueResult<Vec<QueuedEvent>>;

    /// Remove entries from the in-flight marker.
    ///
    /// Returns how many were still held under the given leases. An entry
    /// whose visibility deadline lapsed and that another claim picked up is
    /// left alone and not counted.
    async fn acknowledge(&self, leases: &[Lease]) -> QueueResult<usize>;

    /// Return a claimed entry (with its updated attempt history) to the live
    /// queue once `delay` has elapsed.
    ///
    /// Returns `false` when `entry` no longer holds the current claim, in
    /// which case nothing is written.
    async fn requeue(&self, entry: &QueuedEvent, delay: Duration) -> QueueResult<bool>;

    /// Move a claimed entry into the dead-letter buffer.
    ///
    /// Returns `false` when `entry` no longer holds the current claim.
    async fn dead_letter(&self, entry: DeadLetterEntry) -> QueueResult<bool>;

    /// Current buffer sizes.
    async fn stats(&self) -> QueueResult<QueueStats>;

    /// Oldest-first view of the dead-letter buffer.
    async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<DeadLetterEntry>>;
}
