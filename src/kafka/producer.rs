use anyhow::{Context, Result};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::KafkaConfig;
use crate::error::PublishError;
use crate::event::Event;

/// Downstream publisher seam.
///
/// Each `publish` call either makes the record durable as a whole or fails as
/// a whole; bounded transport-level retries inside the call are allowed.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &Event) -> Result<(), PublishError>;
}

/// Timeout for one send including the client's internal retries
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Kafka producer for the outbound record stream.
///
/// Configured for durability over latency:
/// - `acks=all`: wait for every in-sync replica
/// - `enable.idempotence=true`: no duplicates within a producer session
/// - bounded client retries; anything beyond them is the retry envelope's job
///
/// The record key is the event id, so downstream consumers that dedupe by key
/// observe each logical event once even when the bridge re-publishes.
#[derive(Clone)]
pub struct KafkaPublisher {
    producer: FutureProducer,
    topic: String,
}

impl KafkaPublisher {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        info!("initializing kafka producer...");
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("message.send.max.retries", "3")
            .set("compression.type", "snappy")
            .set("linger.ms", "10")
            .set("request.timeout.ms", "10000")
            .set("message.timeout.ms", "25000")
            .create()
            .context("failed to create kafka producer")?;

        info!(
            brokers = %config.brokers,
            topic = %config.topic,
            "kafka producer initialized"
        );

        Ok(Self {
            producer,
            topic: config.topic.clone(),
        })
    }

    /// Wait for in-flight batches to drain; called on graceful shutdown.
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        self.producer
            .flush(Timeout::After(timeout))
            .context("failed to flush kafka producer")
    }
}

#[async_trait]
impl EventPublisher for KafkaPublisher {
    async fn publish(&self, event: &Event) -> Result<(), PublishError> {
        // Permanent: the same payload fails the same way every time.
        let value = serde_json::to_vec(&event.payload)?;

        let headers = OwnedHeaders::new().insert(Header {
            key: "correlation_id",
            value: Some(event.correlation_id.as_bytes()),
        });
        let record = FutureRecord::to(&self.topic)
            .key(event.id.as_bytes())
            .payload(&value)
            .headers(headers);

        let start = std::time::Instant::now();
        match self.producer.send(record, Timeout::After(SEND_TIMEOUT)).await {
            Ok((partition, offset)) => {
                debug!(
                    event_id = %event.id,
                    partition,
                    offset,
                    latency_ms = start.elapsed().as_millis() as u64,
                    "record persisted to kafka"
                );
                Ok(())
            }
            Err((err, _)) => {
                error!(
                    event_id = %event.id,
                    topic = %self.topic,
                    error = %err,
                    "failed to publish record to kafka"
                );
                Err(PublishError::Transport(err.to_string()))
            }
        }
    }
}
