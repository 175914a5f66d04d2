//! In-process ledger for tests and single-process development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{IdempotencyError, IdempotencyResult};
use crate::IdempotencyLedger;

#[derive(Debug, Clone, Copy)]
struct Record {
    processed_at: DateTime<Utc>,
    expires_at: Instant,
}

/// Ledger held in process memory. Clones share records.
#[derive(Clone, Default)]
pub struct InMemoryLedger {
    records: Arc<Mutex<HashMap<String, Record>>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// First-processed timestamp of an unexpired record.
    pub fn processed_at(&self, event_id: &str) -> Option<DateTime<Utc>> {
        let now = Instant::now();
        self.records
            .lock()
            .get(event_id)
            .filter(|r| r.expires_at > now)
            .map(|r| r.processed_at)
    }

    /// Number of unexpired records.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.records
            .lock()
            .values()
            .filter(|r| r.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl IdempotencyLedger for InMemoryLedger {
    async fn record(&self, event_id: &str, ttl: Duration) -> IdempotencyResult<bool> {
        if ttl.is_zero() {
            return Err(IdempotencyError::InvalidTtl("ttl must be positive".to_string()));
        }

        let now = Instant::now();
        let mut records = self.records.lock();
        records.retain(|_, r| r.expires_at > now);

        if records.contains_key(event_id) {
            return Ok(false);
        }
        records.insert(
            event_id.to_string(),
            Record {
                processed_at: Utc::now(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn contains(&self, event_id: &str) -> IdempotencyResult<bool> {
        Ok(self.processed_at(event_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_then_contains() {
        let ledger = InMemoryLedger::new();
        assert!(!ledger.contains("e1").await.unwrap());

        assert!(ledger.record("e1", Duration::from_secs(60)).await.unwrap());
        assert!(ledger.contains("e1").await.unwrap());
        assert!(ledger.processed_at("e1").is_some());
    }

    #[tokio::test]
    async fn test_second_record_keeps_first_timestamp() {
        let ledger = InMemoryLedger::new();
        ledger.record("e1", Duration::from_secs(60)).await.unwrap();
        let first = ledger.processed_at("e1");

        assert!(!ledger.record("e1", Duration::from_secs(60)).await.unwrap());
        assert_eq!(ledger.processed_at("e1"), first);
    }

    #[tokio::test]
    async fn test_records_expire_after_ttl() {
        let ledger = InMemoryLedger::new();
        ledger.record("e1", Duration::from_millis(20)).await.unwrap();
        assert_eq!(ledger.len(), 1);

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(!ledger.contains("e1").await.unwrap());
        assert!(ledger.is_empty());
        // Expired identifier can be recorded afresh.
        assert!(ledger.record("e1", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_ttl_is_rejected() {
        let ledger = InMemoryLedger::new();
        let err = ledger.record("e1", Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, IdempotencyError::InvalidTtl(_)));
    }

    #[tokio::test]
    async fn test_clones_share_records() {
        let ledger = InMemoryLedger::new();
        let other = ledger.clone();
        ledger.record("shared", Duration::from_secs(60)).await.unwrap();
        assert!(other.contains("shared").await.unwrap());
    }
}
