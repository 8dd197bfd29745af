// ============================================================================
// RabbitMQ Consumer
// ============================================================================
//
// Fans one manually-acknowledged delivery stream out to a fixed pool of
// workers. Prefetch equals the worker count, so the broker never dispatches
// more un-acked deliveries than the pool can absorb.
//
// Settlement discipline, exactly one per delivery:
// - undecodable body        -> nack, requeue=false (poison)
// - missing/empty event_id  -> ack (drop, counted)
// - processor success       -> ack
// - processor error         -> nack, requeue=true
//
// ============================================================================

use anyhow::{Context, Result};
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, Consumer};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::event::Event;
use crate::metrics::{Metrics, DROP_DECODE, DROP_MISSING_ID};
use crate::processor::EventProcessor;

/// Fixed consumer tag identifying this process to the broker
const CONSUMER_TAG: &str = "event-bridge";

pub struct RabbitMqConsumer {
    connection: Connection,
    channel: Channel,
    queue: String,
    worker_count: usize,
    processor: Arc<EventProcessor>,
    metrics: Arc<Metrics>,
}

impl RabbitMqConsumer {
    pub async fn connect(
        config: &Config,
        processor: Arc<EventProcessor>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let connection = Connection::connect(&config.rabbitmq_url, ConnectionProperties::default())
            .await
            .context("failed to connect to rabbitmq")?;

        let channel = connection
            .create_channel()
            .await
            .context("failed to open a channel")?;

        // Prefetch matches the worker count
        channel
            .basic_qos(config.worker_count as u16, BasicQosOptions::default())
            .await
            .context("failed to set qos")?;

        info!(
            queue = %config.rabbitmq_queue,
            prefetch = config.worker_count,
            "rabbitmq consumer ready"
        );

        Ok(Self {
            connection,
            channel,
            queue: config.rabbitmq_queue.clone(),
            worker_count: config.worker_count,
            processor,
            metrics,
        })
    }

    /// Consume until `cancel` fires.
    ///
    /// On cancellation, workers stop taking new deliveries, settle their
    /// in-flight one and join; the channel and connection are closed after
    /// the join so every settle RPC completes. Returns once shutdown is done.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let consumer = self
            .channel
            .basic_consume(
                &self.queue,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .context("failed to register a consumer")?;
        let deliveries = Arc::new(Mutex::new(consumer));

        let mut workers = JoinSet::new();
        for worker_id in 0..self.worker_count {
            let deliveries = Arc::clone(&deliveries);
            let processor = Arc::clone(&self.processor);
            let metrics = Arc::clone(&self.metrics);
            let cancel = cancel.clone();
            workers.spawn(async move {
                worker_loop(worker_id, deliveries, processor, metrics, cancel).await;
            });
        }

        cancel.cancelled().await;
        info!("stopping consumer...");
        while workers.join_next().await.is_some() {}

        if let Err(e) = self.channel.close(200, "shutting down").await {
            warn!(error = %e, "error closing rabbitmq channel");
        }
        if let Err(e) = self.connection.close(200, "shutting down").await {
            warn!(error = %e, "error closing rabbitmq connection");
        }
        Ok(())
    }
}

async fn worker_loop(
    worker_id: usize,
    deliveries: Arc<Mutex<Consumer>>,
    processor: Arc<EventProcessor>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) {
    debug!(worker_id, "worker started");
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = async { deliveries.lock().await.next().await } => next,
        };

        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(e)) => {
                error!(worker_id, error = %e, "delivery stream error");
                continue;
            }
            // Stream closed by the broker or by shutdown
            None => break,
        };

        handle_delivery(worker_id, delivery, &processor, &metrics, &cancel).await;
    }
    debug!(worker_id, "worker stopped");
}

async fn handle_delivery(
    worker_id: usize,
    delivery: Delivery,
    processor: &EventProcessor,
    metrics: &Metrics,
    cancel: &CancellationToken,
) {
    let event = match Event::from_slice(&delivery.data) {
        Ok(event) => event,
        Err(e) => {
            // Poison message, do not requeue
            error!(worker_id, error = %e, "failed to decode event envelope, dropping");
            metrics
                .events_dropped_total
                .with_label_values(&[DROP_DECODE])
                .inc();
            nack(&delivery, false).await;
            return;
        }
    };
    metrics.events_consumed_total.inc();

    if event.id.is_empty() {
        warn!(worker_id, "event missing event_id, skipping");
        metrics
            .events_dropped_total
            .with_label_values(&[DROP_MISSING_ID])
            .inc();
        ack(&delivery).await;
        return;
    }

    match processor.process(cancel, &event).await {
        Ok(()) => ack(&delivery).await,
        Err(e) => {
            error!(
                worker_id,
                event_id = %event.id,
                correlation_id = %event.correlation_id,
                error = %e,
                "failed to process event, requeueing"
            );
            nack(&delivery, true).await;
        }
    }
}

async fn ack(delivery: &Delivery) {
    if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
        error!(error = %e, "failed to ack delivery");
    }
}

async fn nack(delivery: &Delivery, requeue: bool) {
    let options = BasicNackOptions {
        requeue,
        ..Default::default()
    };
    if let Err(e) = delivery.nack(options).await {
        error!(error = %e, requeue, "failed to nack delivery");
    }
}
