//! Batch consumer.
//!
//! ```text
//! IDLE → CLAIMING → PROCESSING → COMMITTING → IDLE
//!                        ↓
//!                      ERROR → RETRY_WAIT  (attempts < max_retries)
//!                            → DEAD_LETTER (budget exhausted or permanent)
//! ```
//!
//! Effect failures are handled per event and never abort the batch. Queue
//! store failures abort the current step; whatever stays claimed is recovered
//! by the visibility timeout and the consumer backs off before claiming again.

use chrono::{DateTime, Utc};
use event_queue::{
    DeadLetterEntry, DeadLetterReason, Event, QueueResult, QueueStore, QueuedEvent,
};
use idempotent_consumer::{IdempotencyGuard, ProcessingResult};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::effects::{BusinessEffect, EffectError};
use crate::config::ConsumerConfig;
use crate::metrics;

const INFRA_BACKOFF_BASE: Duration = Duration::from_millis(500);
const INFRA_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// True once shutdown was signalled or the signalling side went away.
pub fn stop_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Pause after `failures` consecutive queue store errors.
pub fn infra_backoff(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    INFRA_BACKOFF_BASE
        .saturating_mul(1u32 << exponent)
        .min(INFRA_BACKOFF_MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Claiming,
    Processing,
    Committing,
    Error,
    RetryWait,
    DeadLetter,
}

impl ConsumerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerState::Idle => "idle",
            ConsumerState::Claiming => "claiming",
            ConsumerState::Processing => "processing",
            ConsumerState::Committing => "committing",
            ConsumerState::Error => "error",
            ConsumerState::RetryWait => "retry_wait",
            ConsumerState::DeadLetter => "dead_letter",
        }
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entries claimed by one consumer invocation.
#[derive(Debug, Clone)]
pub struct ClaimedBatch {
    pub events: Vec<QueuedEvent>,
    pub claimed_at: DateTime<Utc>,
    pub visibility_deadline: DateTime<Utc>,
    pub batch_size_bound: usize,
}

impl ClaimedBatch {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// What happened to one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub claimed: usize,
    pub processed: usize,
    pub duplicates: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub acknowledged: usize,
}

/// Counters shared by every consumer instance of a process.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    batches: AtomicU64,
    processed: AtomicU64,
    duplicates: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    failed_attempts: AtomicU64,
    latency_ms_total: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConsumerStatsSnapshot {
    pub batches_processed: u64,
    pub events_processed: u64,
    pub duplicates_skipped: u64,
    pub retries_scheduled: u64,
    pub dead_lettered: u64,
    pub failed_attempts: u64,
    pub average_latency_ms: f64,
}

impl ConsumerStats {
    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        let processed = self.processed.load(Ordering::Relaxed);
        let latency_total = self.latency_ms_total.load(Ordering::Relaxed);
        ConsumerStatsSnapshot {
            batches_processed: self.batches.load(Ordering::Relaxed),
            events_processed: processed,
            duplicates_skipped: self.duplicates.load(Ordering::Relaxed),
            retries_scheduled: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            average_latency_ms: if processed == 0 {
                0.0
            } else {
                latency_total as f64 / processed as f64
            },
        }
    }

    fn record_processed(&self, received_at: DateTime<Utc>) {
        let latency = (Utc::now() - received_at).to_std().unwrap_or_default();
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.latency_ms_total
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
        metrics::EVENT_LATENCY_SECONDS.observe(latency.as_secs_f64());
    }
}

enum Outcome {
    Processed,
    Duplicate,
    Failed { error: String, permanent: bool },
}

/// One consumer instance. Several may run against the same queue store.
pub struct BatchConsumer {
    name: String,
    queue: Arc<dyn QueueStore>,
    guard: IdempotencyGuard,
    effect: Arc<dyn BusinessEffect>,
    config: ConsumerConfig,
    stats: Arc<ConsumerStats>,
    shutdown: watch::Receiver<bool>,
    state: ConsumerState,
}

impl BatchConsumer {
    pub fn new(
        name: impl Into<String>,
        queue: Arc<dyn QueueStore>,
        guard: IdempotencyGuard,
        effect: Arc<dyn BusinessEffect>,
        config: ConsumerConfig,
        stats: Arc<ConsumerStats>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            name: name.into(),
            queue,
            guard,
            effect,
            config,
            stats,
            shutdown,
            state: ConsumerState::Idle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// Drain the queue until shutdown is requested.
    ///
    /// A batch in progress when the stop request arrives is finished first.
    pub async fn run(mut self) {
        info!(
            consumer = %self.name,
            batch_size = self.config.batch_size,
            batch_timeout_ms = self.config.batch_timeout.as_millis() as u64,
            max_retries = self.config.max_retries,
            dry_run = self.config.dry_run,
            "Batch consumer started"
        );

        let mut infra_failures: u32 = 0;
        while !stop_requested(&self.shutdown) {
            match self.run_once().await {
                Ok(_) => infra_failures = 0,
                Err(e) => {
                    infra_failures = infra_failures.saturating_add(1);
                    let delay = infra_backoff(infra_failures);
                    error!(
                        consumer = %self.name,
                        error = %e,
                        consecutive_failures = infra_failures,
                        retry_in_ms = delay.as_millis() as u64,
                        "Queue store unavailable, pausing consumption"
                    );
                    self.transition(ConsumerState::Idle);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.changed() => {}
                    }
                }
            }
        }

        let stats = self.stats.snapshot();
        info!(
            consumer = %self.name,
            batches = stats.batches_processed,
            processed = stats.events_processed,
            duplicates = stats.duplicates_skipped,
            retried = stats.retries_scheduled,
            dead_lettered = stats.dead_lettered,
            average_latency_ms = stats.average_latency_ms,
            "Batch consumer stopped"
        );
    }

    /// Claim one batch and take it all the way through commit.
    pub async fn run_once(&mut self) -> QueueResult<BatchReport> {
        let batch = self.claim_batch().await?;
        if batch.is_empty() {
            self.transition(ConsumerState::Idle);
            return Ok(BatchReport::default());
        }
        self.process_batch(batch).await
    }

    /// Claim up to `batch_size` entries, polling until the batch is full,
    /// `batch_timeout` elapses, or shutdown is requested.
    pub async fn claim_batch(&mut self) -> QueueResult<ClaimedBatch> {
        self.transition(ConsumerState::Claiming);

        let bound = self.config.batch_size;
        let visibility = self.config.visibility_timeout;
        let claimed_at = Utc::now();
        let deadline = Instant::now() + self.config.batch_timeout;
        let mut events: Vec<QueuedEvent> = Vec::with_capacity(bound);

        loop {
            match self.queue.claim(bound - events.len(), visibility).await {
                Ok(mut claimed) => events.append(&mut claimed),
                Err(e) if events.is_empty() => {
                    metrics::record_queue_error("claim");
                    return Err(e);
                }
                Err(e) => {
                    metrics::record_queue_error("claim");
                    warn!(
                        consumer = %self.name,
                        error = %e,
                        claimed = events.len(),
                        "Claim failed while filling batch, processing partial batch"
                    );
                    break;
                }
            }

            if events.len() >= bound || stop_requested(&self.shutdown) {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }

            let wait = self.config.poll_interval().min(deadline - now);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.shutdown.changed() => {}
            }
        }

        if !events.is_empty() {
            metrics::BATCHES_CLAIMED_TOTAL.inc();
            metrics::BATCH_SIZE.observe(events.len() as f64);
            debug!(
                consumer = %self.name,
                batch_size = events.len(),
                bound,
                "Batch claimed"
            );
        }

        let visibility_deadline = chrono::Duration::from_std(visibility)
            .ok()
            .and_then(|d| claimed_at.checked_add_signed(d))
            .unwrap_or(claimed_at);

        Ok(ClaimedBatch {
            events,
            claimed_at,
            visibility_deadline,
            batch_size_bound: bound,
        })
    }

    /// Process every entry in claim order, then acknowledge the ones that
    /// were applied or skipped as duplicates.
    pub async fn process_batch(&mut self, batch: ClaimedBatch) -> QueueResult<BatchReport> {
        self.transition(ConsumerState::Processing);

        let mut report = BatchReport {
            claimed: batch.len(),
            ..BatchReport::default()
        };
        let mut to_ack = Vec::with_capacity(batch.len());

        for mut entry in batch.events {
            let started_at = Utc::now();
            match self.process_entry(&entry).await {
                Outcome::Processed => {
                    report.processed += 1;
                    self.stats.record_processed(entry.event.received_at);
                    metrics::record_consumed("processed");
                    to_ack.extend(entry.lease());
                }
                Outcome::Duplicate => {
                    report.duplicates += 1;
                    self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                    metrics::record_consumed("duplicate");
                    to_ack.extend(entry.lease());
                }
                Outcome::Failed { error, permanent } => {
                    self.transition(ConsumerState::Error);
                    self.stats.failed_attempts.fetch_add(1, Ordering::Relaxed);
                    let attempt = entry.record_failure(started_at, error);

                    if !permanent && attempt < self.config.max_retries {
                        if self.schedule_retry(&entry, attempt).await {
                            report.retried += 1;
                        }
                    } else if self.dead_letter(entry, permanent).await {
                        report.dead_lettered += 1;
                    }
                    self.transition(ConsumerState::Processing);
                }
            }
        }

        self.transition(ConsumerState::Committing);
        if !to_ack.is_empty() {
            match self.queue.acknowledge(&to_ack).await {
                Ok(acked) => {
                    if acked < to_ack.len() {
                        warn!(
                            consumer = %self.name,
                            requested = to_ack.len(),
                            acknowledged = acked,
                            "Claims lapsed before commit, entries left to their current holders"
                        );
                    }
                    report.acknowledged = acked;
                }
                Err(e) => {
                    metrics::record_queue_error("acknowledge");
                    return Err(e);
                }
            }
        }

        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        if let Ok(queue_stats) = self.queue.stats().await {
            metrics::set_queue_depth(&queue_stats);
        }
        self.transition(ConsumerState::Idle);

        info!(
            consumer = %self.name,
            claimed = report.claimed,
            processed = report.processed,
            duplicates = report.duplicates,
            retried = report.retried,
            dead_lettered = report.dead_lettered,
            "Batch committed"
        );
        Ok(report)
    }

    async fn process_entry(&self, entry: &QueuedEvent) -> Outcome {
        let event = &entry.event;
        let result = self
            .guard
            .process_if_new(&event.event_id, || self.apply_effect(event))
            .await;

        match result {
            Ok(ProcessingResult::Success) => Outcome::Processed,
            Ok(ProcessingResult::AlreadyProcessed) => {
                info!(
                    consumer = %self.name,
                    event_id = %event.event_id,
                    entry_id = %entry.entry_id,
                    "Duplicate delivery, skipping business effect"
                );
                Outcome::Duplicate
            }
            Ok(ProcessingResult::Failed(e)) => Outcome::Failed {
                permanent: e.is_permanent(),
                error: e.to_string(),
            },
            Err(e) => {
                warn!(
                    consumer = %self.name,
                    event_id = %event.event_id,
                    error = %e,
                    transient = e.is_transient(),
                    "Idempotency check failed, effect not applied"
                );
                Outcome::Failed {
                    error: e.to_string(),
                    permanent: !e.is_transient(),
                }
            }
        }
    }

    async fn apply_effect(&self, event: &Event) -> Result<(), EffectError> {
        if self.config.dry_run {
            info!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                "Dry run, business effect skipped"
            );
            return Ok(());
        }
        self.effect.apply(event).await
    }

    async fn schedule_retry(&mut self, entry: &QueuedEvent, attempt: u32) -> bool {
        self.transition(ConsumerState::RetryWait);
        let delay = self.config.retry_delay_for(attempt);

        match self.queue.requeue(entry, delay).await {
            Ok(true) => {
                self.stats.retried.fetch_add(1, Ordering::Relaxed);
                metrics::record_consumed("retried");
                warn!(
                    consumer = %self.name,
                    event_id = %entry.event_id(),
                    attempt,
                    max_retries = self.config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = entry.last_error().unwrap_or_default(),
                    "Event failed, retry scheduled"
                );
                true
            }
            Ok(false) => {
                warn!(
                    consumer = %self.name,
                    event_id = %entry.event_id(),
                    "Claim on entry lapsed, retry left to its current holder"
                );
                false
            }
            Err(e) => {
                metrics::record_queue_error("requeue");
                error!(
                    consumer = %self.name,
                    event_id = %entry.event_id(),
                    error = %e,
                    "Requeue failed, entry reappears after its visibility timeout"
                );
                false
            }
        }
    }

    async fn dead_letter(&mut self, entry: QueuedEvent, permanent: bool) -> bool {
        self.transition(ConsumerState::DeadLetter);

        let reason = if permanent {
            DeadLetterReason::PermanentFailure
        } else {
            DeadLetterReason::MaxRetriesExceeded
        };
        let event_id = entry.event_id().to_string();
        let attempts = entry.attempt_count();
        let dead = DeadLetterEntry::from_entry(entry, reason);
        let last_error = dead.last_error.clone().unwrap_or_default();

        match self.queue.dead_letter(dead).await {
            Ok(true) => {
                self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
                metrics::record_consumed("dead_lettered");
                error!(
                    consumer = %self.name,
                    event_id = %event_id,
                    attempts,
                    reason = reason.as_str(),
                    last_error = %last_error,
                    "Event moved to dead-letter buffer"
                );
                true
            }
            Ok(false) => {
                warn!(
                    consumer = %self.name,
                    event_id = %event_id,
                    "Claim on entry lapsed, not dead-lettered"
                );
                false
            }
            Err(e) => {
                metrics::record_queue_error("dead_letter");
                error!(
                    consumer = %self.name,
                    event_id = %event_id,
                    error = %e,
                    "Dead-lettering failed, entry reappears after its visibility timeout"
                );
                false
            }
        }
    }

    fn transition(&mut self, next: ConsumerState) {
        if self.state == next {
            return;
        }
        debug!(
            consumer = %self.name,
            from = %self.state,
            state = %next,
            batch_size = self.config.batch_size,
            "Consumer state transition"
        );
        metrics::CONSUMER_TRANSITIONS_TOTAL
            .with_label_values(&[next.as_str()])
            .inc();
        self.state = next;
    }
}
