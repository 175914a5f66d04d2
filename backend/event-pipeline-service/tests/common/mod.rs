#![allow(dead_code)]

pub mod mock_effect;

use async_trait::async_trait;
use chrono::Utc;
use event_pipeline_service::config::ConsumerConfig;
use event_pipeline_service::services::{BatchConsumer, BusinessEffect, ConsumerStats};
use event_queue::{Event, InMemoryQueueStore};
use idempotent_consumer::{
    IdempotencyError, IdempotencyGuard, IdempotencyLedger, IdempotencyResult, InMemoryLedger,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub use mock_effect::MockEffect;

pub fn event(id: &str, event_type: &str) -> Event {
    event_with_payload(id, event_type, json!({}))
}

pub fn event_with_payload(id: &str, event_type: &str, payload: Value) -> Event {
    Event {
        event_id: id.to_string(),
        event_type: event_type.to_string(),
        payload,
        source: "test".to_string(),
        received_at: Utc::now(),
        occurred_at: None,
    }
}

/// Ledger whose backend is always down.
pub struct UnavailableLedger;

#[async_trait]
impl IdempotencyLedger for UnavailableLedger {
    async fn record(&self, _event_id: &str, _ttl: Duration) -> IdempotencyResult<bool> {
        Err(IdempotencyError::Other(anyhow::anyhow!("ledger unreachable")))
    }

    async fn contains(&self, _event_id: &str) -> IdempotencyResult<bool> {
        Err(IdempotencyError::Other(anyhow::anyhow!("ledger unreachable")))
    }
}

/// Ledger that rejects every call with a configuration error.
pub struct MisconfiguredLedger;

#[async_trait]
impl IdempotencyLedger for MisconfiguredLedger {
    async fn record(&self, _event_id: &str, _ttl: Duration) -> IdempotencyResult<bool> {
        Err(IdempotencyError::InvalidTtl("ttl exceeds ledger limit".into()))
    }

    async fn contains(&self, _event_id: &str) -> IdempotencyResult<bool> {
        Err(IdempotencyError::InvalidTtl("ttl exceeds ledger limit".into()))
    }
}

/// Short timeouts so tests finish quickly; retries are requeued without delay.
pub fn fast_config() -> ConsumerConfig {
    ConsumerConfig {
        batch_size: 10,
        batch_timeout: Duration::from_millis(50),
        visibility_timeout: Duration::from_secs(5),
        max_retries: 3,
        retry_delay: Duration::ZERO,
        idempotency_ttl: Duration::from_secs(60),
        ..ConsumerConfig::default()
    }
}

/// In-memory queue and ledger shared by every consumer built from it.
pub struct Harness {
    pub queue: InMemoryQueueStore,
    pub ledger: InMemoryLedger,
    pub stats: Arc<ConsumerStats>,
    pub stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl Harness {
    pub fn new() -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            queue: InMemoryQueueStore::new(),
            ledger: InMemoryLedger::new(),
            stats: Arc::new(ConsumerStats::default()),
            stop_tx,
            stop_rx,
        }
    }

    pub fn guard(&self, config: &ConsumerConfig) -> IdempotencyGuard {
        IdempotencyGuard::new(Arc::new(self.ledger.clone()), config.idempotency_ttl)
    }

    pub fn consumer(
        &self,
        name: &str,
        effect: Arc<dyn BusinessEffect>,
        config: ConsumerConfig,
    ) -> BatchConsumer {
        let guard = self.guard(&config);
        self.consumer_with_guard(name, guard, effect, config)
    }

    pub fn consumer_with_guard(
        &self,
        name: &str,
        guard: IdempotencyGuard,
        effect: Arc<dyn BusinessEffect>,
        config: ConsumerConfig,
    ) -> BatchConsumer {
        BatchConsumer::new(
            name,
            Arc::new(self.queue.clone()),
            guard,
            effect,
            config,
            self.stats.clone(),
            self.stop_rx.clone(),
        )
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

/// Poll `check` every 20ms until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
