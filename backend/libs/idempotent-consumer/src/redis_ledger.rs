//! Ledger stored in Redis, one key per processed identifier.

use async_trait::async_trait;
use chrono::Utc;
use redis_utils::{namespaced_key, SharedConnectionManager};
use std::time::Duration;

use crate::error::{IdempotencyError, IdempotencyResult};
use crate::IdempotencyLedger;

/// `{ns}:idempotency:{event_id}` holding the RFC 3339 time of first processing.
#[derive(Clone)]
pub struct RedisLedger {
    redis: SharedConnectionManager,
    namespace: String,
}

impl RedisLedger {
    pub fn new(redis: SharedConnectionManager, namespace: impl Into<String>) -> Self {
        Self {
            redis,
            namespace: namespace.into(),
        }
    }

    pub fn key_for(&self, event_id: &str) -> String {
        namespaced_key(&self.namespace, &["idempotency", event_id])
    }
}

#[async_trait]
impl IdempotencyLedger for RedisLedger {
    async fn record(&self, event_id: &str, ttl: Duration) -> IdempotencyResult<bool> {
        let ttl_secs = ttl.as_secs();
        if ttl_secs == 0 {
            return Err(IdempotencyError::InvalidTtl(format!(
                "ttl must be at least one second, got {:?}",
                ttl
            )));
        }

        let mut conn = self.redis.lock().await.clone();
        let created: Option<String> = redis::cmd("SET")
            .arg(self.key_for(event_id))
            .arg(Utc::now().to_rfc3339())
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;

        Ok(created.is_some())
    }

    async fn contains(&self, event_id: &str) -> IdempotencyResult<bool> {
        let mut conn = self.redis.lock().await.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(self.key_for(event_id))
            .query_async(&mut conn)
            .await?;
        Ok(exists)
    }
}
