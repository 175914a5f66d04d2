//! Integration tests for the Redis idempotency ledger
//!
//! These tests verify:
//! 1. Record / contains against a real broker
//! 2. Duplicate record returns false (SET NX)
//! 3. Records expire after their TTL
//! 4. Concurrent consumers apply the effect at most once per record
//!
//! They start a `redis:7-alpine` container and therefore need Docker:
//! ```bash
//! cargo test --package idempotent-consumer --test integration_test -- --ignored
//! ```

use futures::future::join_all;
use idempotent_consumer::{IdempotencyGuard, IdempotencyLedger, ProcessingResult, RedisLedger};
use redis::aio::ConnectionManager;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use testcontainers::{core::WaitFor, runners::AsyncRunner, ContainerAsync, GenericImage};
use tokio::sync::Mutex;

async fn start_redis() -> (ContainerAsync<GenericImage>, String) {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));

    let container = image.start().await;
    let port = container.get_host_port_ipv4(6379).await;
    (container, format!("redis://127.0.0.1:{}/", port))
}

async fn build_ledger(url: &str) -> RedisLedger {
    let client = redis::Client::open(url).expect("redis client");
    let conn = ConnectionManager::new(client)
        .await
        .expect("redis connection");
    RedisLedger::new(Arc::new(Mutex::new(conn)), "it")
}

/// Test: Record then contains, duplicate record is refused
#[ignore = "Requires Docker for the Redis container"]
#[tokio::test]
async fn test_record_and_duplicate() {
    let (_container, url) = start_redis().await;
    let ledger = build_ledger(&url).await;

    assert!(!ledger.contains("evt-1").await.expect("contains"));

    let first = ledger
        .record("evt-1", Duration::from_secs(60))
        .await
        .expect("record");
    assert!(first, "First record should return true");

    let second = ledger
        .record("evt-1", Duration::from_secs(60))
        .await
        .expect("record");
    assert!(!second, "Duplicate record should return false (SET NX)");

    assert!(ledger.contains("evt-1").await.expect("contains"));
}

/// Test: Record disappears after its TTL
#[ignore = "Requires Docker for the Redis container"]
#[tokio::test]
async fn test_record_expires() {
    let (_container, url) = start_redis().await;
    let ledger = build_ledger(&url).await;

    ledger
        .record("evt-ttl", Duration::from_secs(1))
        .await
        .expect("record");
    assert!(ledger.contains("evt-ttl").await.expect("contains"));

    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert!(!ledger.contains("evt-ttl").await.expect("contains"));
}

/// Test: Sequential redeliveries through the guard run the effect once
#[ignore = "Requires Docker for the Redis container"]
#[tokio::test]
async fn test_guard_suppresses_redelivery() {
    let (_container, url) = start_redis().await;
    let guard = IdempotencyGuard::new(
        Arc::new(build_ledger(&url).await),
        Duration::from_secs(60),
    );
    let counter = Arc::new(AtomicU32::new(0));

    let mut results = Vec::new();
    for _ in 0..5 {
        let counter = counter.clone();
        let result = guard
            .process_if_new("evt-redelivered", || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), String>(())
            })
            .await
            .expect("process");
        results.push(result);
    }

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(results[0], ProcessingResult::Success);
    assert!(results[1..]
        .iter()
        .all(|r| *r == ProcessingResult::AlreadyProcessed));
}

/// Test: Ten concurrent recorders, exactly one wins
#[ignore = "Requires Docker for the Redis container"]
#[tokio::test]
async fn test_concurrent_record_single_winner() {
    let (_container, url) = start_redis().await;
    let ledger = Arc::new(build_ledger(&url).await);

    let attempts = (0..10).map(|_| {
        let ledger = ledger.clone();
        async move {
            ledger
                .record("evt-race", Duration::from_secs(60))
                .await
                .expect("record")
        }
    });

    let winners = join_all(attempts).await.into_iter().filter(|won| *won).count();
    assert_eq!(winners, 1, "Only one concurrent record should succeed");
}
