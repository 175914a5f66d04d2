//! Batch consumer behavior against the in-memory queue store and ledger.

mod common;

use common::{
    event, fast_config, wait_until, Harness, MisconfiguredLedger, MockEffect, UnavailableLedger,
};
use event_pipeline_service::services::ConsumerState;
use event_queue::{DeadLetterReason, QueueStore};
use idempotent_consumer::{IdempotencyGuard, IdempotencyLedger};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_transient_failures_recover_within_retry_budget() {
    let harness = Harness::new();
    let effect = Arc::new(MockEffect::new().failing("e1", 2));
    let mut consumer = harness.consumer("c0", effect.clone(), fast_config());

    harness.queue.append(event("e1", "user_signup")).await.unwrap();

    let first = consumer.run_once().await.unwrap();
    assert_eq!(first.retried, 1);
    let second = consumer.run_once().await.unwrap();
    assert_eq!(second.retried, 1);
    let third = consumer.run_once().await.unwrap();
    assert_eq!(third.processed, 1);
    assert_eq!(third.acknowledged, 1);

    assert_eq!(effect.applied_count("e1"), 1);
    let stats = harness.stats.snapshot();
    assert_eq!(stats.retries_scheduled, 2);
    assert_eq!(stats.failed_attempts, 2);
    assert_eq!(stats.dead_lettered, 0);

    let queue_stats = harness.queue.stats().await.unwrap();
    assert_eq!(queue_stats.pending(), 0);
    assert_eq!(queue_stats.dead_lettered, 0);
    assert_eq!(consumer.state(), ConsumerState::Idle);
}

#[tokio::test]
async fn test_exhausted_retries_dead_letter_with_history() {
    let harness = Harness::new();
    let effect = Arc::new(MockEffect::always_failing());
    let mut consumer = harness.consumer("c0", effect.clone(), fast_config());

    harness.queue.append(event("e1", "user_signup")).await.unwrap();

    for _ in 0..2 {
        let report = consumer.run_once().await.unwrap();
        assert_eq!(report.retried, 1);
    }
    let last = consumer.run_once().await.unwrap();
    assert_eq!(last.dead_lettered, 1);
    assert_eq!(last.acknowledged, 0);

    let dead = harness.queue.dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].event_id(), Some("e1"));
    assert_eq!(dead[0].reason, DeadLetterReason::MaxRetriesExceeded);
    assert_eq!(dead[0].attempt_count(), 3);
    assert!(dead[0]
        .last_error
        .as_deref()
        .unwrap()
        .contains("downstream unavailable"));

    // Nothing left to redeliver.
    let report = consumer.run_once().await.unwrap();
    assert_eq!(report.claimed, 0);
    assert!(effect.applied().is_empty());
    assert_eq!(harness.stats.snapshot().dead_lettered, 1);
}

#[tokio::test]
async fn test_permanent_failure_skips_remaining_retries() {
    let harness = Harness::new();
    let effect = Arc::new(MockEffect::permanently_failing());
    let mut consumer = harness.consumer("c0", effect, fast_config());

    harness.queue.append(event("bad", "subscription_created")).await.unwrap();

    let report = consumer.run_once().await.unwrap();
    assert_eq!(report.retried, 0);
    assert_eq!(report.dead_lettered, 1);

    let dead = harness.queue.dead_letters(10).await.unwrap();
    assert_eq!(dead[0].reason, DeadLetterReason::PermanentFailure);
    assert_eq!(dead[0].attempt_count(), 1);
}

#[tokio::test]
async fn test_partial_batch_is_processed_after_timeout() {
    let harness = Harness::new();
    let effect = Arc::new(MockEffect::new());
    let config = event_pipeline_service::config::ConsumerConfig {
        batch_timeout: Duration::from_millis(200),
        ..fast_config()
    };
    let mut consumer = harness.consumer("c0", effect.clone(), config);

    for id in ["p1", "p2", "p3"] {
        harness.queue.append(event(id, "usage_tracked")).await.unwrap();
    }

    let started = Instant::now();
    let report = consumer.run_once().await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(report.claimed, 3);
    assert_eq!(report.processed, 3);
    assert!(elapsed >= Duration::from_millis(150), "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "returned after {:?}", elapsed);
    assert_eq!(effect.applied(), vec!["p1", "p2", "p3"]);
}

#[tokio::test]
async fn test_batches_never_exceed_batch_size() {
    let harness = Harness::new();
    let effect = Arc::new(MockEffect::new());
    let mut consumer = harness.consumer("c0", effect.clone(), fast_config());

    for i in 0..25 {
        harness
            .queue
            .append(event(&format!("evt-{}", i), "usage_tracked"))
            .await
            .unwrap();
    }

    let mut sizes = Vec::new();
    for _ in 0..3 {
        sizes.push(consumer.run_once().await.unwrap().claimed);
    }
    assert_eq!(sizes, vec![10, 10, 5]);
    assert_eq!(effect.applied().len(), 25);
    assert_eq!(harness.stats.snapshot().batches_processed, 3);
}

#[tokio::test]
async fn test_crashed_consumer_batch_is_reclaimed_after_visibility_timeout() {
    let harness = Harness::new();
    let effect = Arc::new(MockEffect::new());
    let config = event_pipeline_service::config::ConsumerConfig {
        visibility_timeout: Duration::from_millis(200),
        ..fast_config()
    };

    harness.queue.append(event("e1", "user_signup")).await.unwrap();

    let mut crashed = harness.consumer("crashed", effect.clone(), config.clone());
    let batch = crashed.claim_batch().await.unwrap();
    assert_eq!(batch.len(), 1);
    drop(batch);
    drop(crashed);

    let mut survivor = harness.consumer("survivor", effect.clone(), config);
    let report = survivor.run_once().await.unwrap();
    assert_eq!(report.claimed, 0, "entry is still hidden by the first claim");

    tokio::time::sleep(Duration::from_millis(250)).await;
    let report = survivor.run_once().await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(effect.applied_count("e1"), 1);
}

#[tokio::test]
async fn test_already_processed_event_is_acknowledged_without_effect() {
    let harness = Harness::new();
    let effect = Arc::new(MockEffect::new());
    let mut consumer = harness.consumer("c0", effect.clone(), fast_config());

    harness
        .ledger
        .record("e1", Duration::from_secs(60))
        .await
        .unwrap();
    harness.queue.append(event("e1", "user_signup")).await.unwrap();

    let report = consumer.run_once().await.unwrap();
    assert_eq!(report.duplicates, 1);
    assert_eq!(report.acknowledged, 1);
    assert!(effect.applied().is_empty());
    assert_eq!(harness.queue.stats().await.unwrap().pending(), 0);
    assert_eq!(harness.stats.snapshot().duplicates_skipped, 1);
}

#[tokio::test]
async fn test_redelivered_identifier_applies_effect_once() {
    let harness = Harness::new();
    let effect = Arc::new(MockEffect::new());
    let mut consumer = harness.consumer("c0", effect.clone(), fast_config());

    harness.queue.append(event("dup", "user_signup")).await.unwrap();
    harness.queue.append(event("dup", "user_signup")).await.unwrap();

    let report = consumer.run_once().await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.duplicates, 1);
    assert_eq!(report.acknowledged, 2);
    assert_eq!(effect.applied_count("dup"), 1);
}

#[tokio::test]
async fn test_dry_run_skips_business_effect() {
    let harness = Harness::new();
    let effect = Arc::new(MockEffect::always_failing());
    let config = event_pipeline_service::config::ConsumerConfig {
        dry_run: true,
        ..fast_config()
    };
    let mut consumer = harness.consumer("c0", effect.clone(), config);

    harness.queue.append(event("e1", "user_signup")).await.unwrap();

    let report = consumer.run_once().await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.retried, 0);
    assert!(effect.applied().is_empty());
}

#[tokio::test]
async fn test_unreachable_ledger_retries_without_applying() {
    let harness = Harness::new();
    let effect = Arc::new(MockEffect::new());
    let config = fast_config();
    let guard = IdempotencyGuard::new(Arc::new(UnavailableLedger), config.idempotency_ttl);
    let mut consumer = harness.consumer_with_guard("c0", guard, effect.clone(), config);

    harness.queue.append(event("e1", "user_signup")).await.unwrap();

    let report = consumer.run_once().await.unwrap();
    assert_eq!(report.retried, 1);
    assert_eq!(report.processed, 0);
    assert!(effect.applied().is_empty());
    assert_eq!(harness.queue.stats().await.unwrap().queued, 1);
}

#[tokio::test]
async fn test_non_transient_ledger_error_dead_letters_immediately() {
    let harness = Harness::new();
    let effect = Arc::new(MockEffect::new());
    let config = fast_config();
    let guard = IdempotencyGuard::new(Arc::new(MisconfiguredLedger), config.idempotency_ttl);
    let mut consumer = harness.consumer_with_guard("c0", guard, effect.clone(), config);

    harness.queue.append(event("e1", "user_signup")).await.unwrap();

    let report = consumer.run_once().await.unwrap();
    assert_eq!(report.retried, 0);
    assert_eq!(report.dead_lettered, 1);
    assert!(effect.applied().is_empty());

    let dead = harness.queue.dead_letters(10).await.unwrap();
    assert_eq!(dead[0].reason, DeadLetterReason::PermanentFailure);
}

#[tokio::test]
async fn test_retry_delay_parks_entry_in_delayed_buffer() {
    let harness = Harness::new();
    let effect = Arc::new(MockEffect::new().failing("e1", 1));
    let config = event_pipeline_service::config::ConsumerConfig {
        retry_delay: Duration::from_secs(30),
        ..fast_config()
    };
    let mut consumer = harness.consumer("c0", effect.clone(), config);

    harness.queue.append(event("e1", "user_signup")).await.unwrap();

    let report = consumer.run_once().await.unwrap();
    assert_eq!(report.retried, 1);

    let stats = harness.queue.stats().await.unwrap();
    assert_eq!(stats.delayed, 1);
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.in_flight, 0);

    let report = consumer.run_once().await.unwrap();
    assert_eq!(report.claimed, 0, "delayed entry must not be claimable yet");
}

#[tokio::test]
async fn test_queue_outage_pauses_and_resumes() {
    let harness = Harness::new();
    let effect = Arc::new(MockEffect::new());
    let consumer = harness.consumer("c0", effect.clone(), fast_config());

    harness.queue.append(event("e1", "user_signup")).await.unwrap();
    harness.queue.append(event("e2", "user_signup")).await.unwrap();
    harness.queue.set_unavailable(true);

    let handle = tokio::spawn(consumer.run());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(effect.applied().is_empty());

    harness.queue.set_unavailable(false);
    let drained = wait_until(Duration::from_secs(5), || effect.applied().len() == 2).await;
    assert!(drained, "consumer did not resume after the outage");

    harness.stop();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("consumer did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_concurrent_consumers_apply_each_event_once() {
    let harness = Harness::new();
    let effect = Arc::new(MockEffect::new());

    for i in 0..50 {
        harness
            .queue
            .append(event(&format!("evt-{}", i), "usage_tracked"))
            .await
            .unwrap();
    }

    let config = event_pipeline_service::config::ConsumerConfig {
        batch_size: 7,
        ..fast_config()
    };
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let consumer = harness.consumer(&format!("c{}", i), effect.clone(), config.clone());
            tokio::spawn(consumer.run())
        })
        .collect();

    let drained = wait_until(Duration::from_secs(5), || effect.applied().len() >= 50).await;
    assert!(drained);

    harness.stop();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("consumer did not stop")
            .unwrap();
    }

    let applied = effect.applied();
    assert_eq!(applied.len(), 50);
    for i in 0..50 {
        assert_eq!(effect.applied_count(&format!("evt-{}", i)), 1);
    }
    assert_eq!(harness.queue.stats().await.unwrap().pending(), 0);
}

#[tokio::test]
async fn test_stop_interrupts_waiting_claim() {
    let harness = Harness::new();
    let effect = Arc::new(MockEffect::new());
    let config = event_pipeline_service::config::ConsumerConfig {
        batch_timeout: Duration::from_secs(10),
        visibility_timeout: Duration::from_secs(30),
        ..fast_config()
    };
    let consumer = harness.consumer("c0", effect, config);

    let handle = tokio::spawn(consumer.run());
    tokio::time::sleep(Duration::from_millis(50)).await;
    harness.stop();

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("stop request was not honored while waiting for a batch")
        .unwrap();
}

#[tokio::test]
async fn test_stop_during_processing_finishes_and_commits_batch() {
    let harness = Harness::new();
    let effect = Arc::new(MockEffect::slow(Duration::from_millis(100)));
    let consumer = harness.consumer("c0", effect.clone(), fast_config());

    for id in ["e1", "e2", "e3"] {
        harness.queue.append(event(id, "user_signup")).await.unwrap();
    }

    let handle = tokio::spawn(consumer.run());
    // The batch is claimed after 50ms and takes 300ms to apply.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(effect.applied().len() < 3, "batch finished before the stop request");
    harness.stop();

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("consumer did not stop after finishing its batch")
        .unwrap();

    assert_eq!(effect.applied(), vec!["e1", "e2", "e3"]);
    let stats = harness.queue.stats().await.unwrap();
    assert_eq!(stats.pending(), 0, "claimed entries were left unacknowledged");
    assert_eq!(harness.stats.snapshot().batches_processed, 1);
}
