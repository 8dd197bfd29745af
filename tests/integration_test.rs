// ============================================================================
// Integration Tests
// ============================================================================
//
// These tests require a running Redis instance (local or test container).
//
// Run with: cargo test --test integration_test -- --ignored
// (Tests are marked with #[ignore] to skip unless Redis is available.)
//
// ============================================================================

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;

use event_bridge::config::RetryConfig;
use event_bridge::error::PublishError;
use event_bridge::event::Event;
use event_bridge::idempotency::{IdempotencyLedger, RedisLedger};
use event_bridge::kafka::producer::EventPublisher;
use event_bridge::metrics::Metrics;
use event_bridge::processor::EventProcessor;

fn redis_url() -> String {
    let addr = std::env::var("REDIS_ADDR").unwrap_or_else(|_| "localhost:6379".to_string());
    format!("redis://{addr}")
}

/// Unique event id per test run so reruns never collide with live marks.
fn unique_event_id(prefix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before unix epoch")
        .as_nanos();
    format!("{prefix}-{}-{nanos}", std::process::id())
}

/// Publisher stub counting durable publishes.
#[derive(Default)]
struct CountingPublisher {
    published: AtomicUsize,
}

#[async_trait]
impl EventPublisher for CountingPublisher {
    async fn publish(&self, _event: &Event) -> Result<(), PublishError> {
        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_ledger_roundtrip() {
    let ledger = RedisLedger::connect(&redis_url())
        .await
        .expect("failed to connect to redis for tests");
    let event_id = unique_event_id("itest-roundtrip");

    assert!(!ledger.is_processed(&event_id).await.unwrap());

    ledger
        .mark_processed(&event_id, Duration::from_secs(60))
        .await
        .unwrap();

    assert!(ledger.is_processed(&event_id).await.unwrap());
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_mark_uses_event_namespace_and_ttl() {
    let ledger = RedisLedger::connect(&redis_url())
        .await
        .expect("failed to connect to redis for tests");
    let event_id = unique_event_id("itest-ttl");

    ledger
        .mark_processed(&event_id, Duration::from_secs(24 * 60 * 60))
        .await
        .unwrap();

    let client = redis::Client::open(redis_url().as_str()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();

    let key = format!("event:{event_id}");
    let value: String = redis::cmd("GET")
        .arg(&key)
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(value, "1");

    let ttl: i64 = redis::cmd("TTL")
        .arg(&key)
        .query_async(&mut conn)
        .await
        .unwrap();
    assert!(ttl > 0 && ttl <= 86400, "unexpected ttl: {ttl}");

    let _: i64 = redis::cmd("DEL")
        .arg(&key)
        .query_async(&mut conn)
        .await
        .unwrap();
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_duplicate_delivery_publishes_once() {
    let ledger = Arc::new(
        RedisLedger::connect(&redis_url())
            .await
            .expect("failed to connect to redis for tests"),
    );
    let publisher = Arc::new(CountingPublisher::default());
    let metrics = Metrics::new().unwrap();
    let processor = EventProcessor::new(
        RetryConfig {
            max_retries: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        },
        Arc::clone(&publisher) as Arc<dyn EventPublisher>,
        Arc::clone(&ledger) as Arc<dyn IdempotencyLedger>,
        metrics,
    );

    let event = Event {
        id: unique_event_id("itest-dup"),
        correlation_id: "corr-456".to_string(),
        payload: json!({"message": "hello integration"}),
    };
    let cancel = CancellationToken::new();

    // first delivery publishes and marks
    processor.process(&cancel, &event).await.unwrap();
    assert!(ledger.is_processed(&event.id).await.unwrap());

    // redelivery is suppressed by the ledger
    processor.process(&cancel, &event).await.unwrap();
    assert_eq!(publisher.published.load(Ordering::SeqCst), 1);
}
