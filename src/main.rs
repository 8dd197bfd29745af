use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use event_bridge::config::Config;
use event_bridge::health;
use event_bridge::idempotency::RedisLedger;
use event_bridge::kafka::KafkaPublisher;
use event_bridge::metrics::Metrics;
use event_bridge::processor::EventProcessor;
use event_bridge::rabbitmq::RabbitMqConsumer;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("failed to load config")?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.clone()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("=== Event Bridge Starting ===");
    info!(
        "RabbitMQ: {} (queue '{}')",
        config.rabbitmq_url_safe(),
        config.rabbitmq_queue
    );
    info!(
        "Kafka: {} (topic '{}')",
        config.kafka.brokers, config.kafka.topic
    );
    info!("Redis: {}", config.redis_url_safe());
    info!("Workers: {}", config.worker_count);

    let metrics = Metrics::new().context("failed to register metrics")?;

    let ledger = Arc::new(
        RedisLedger::connect(&config.redis_url())
            .await
            .context("failed to connect to redis")?,
    );

    let publisher = KafkaPublisher::new(&config.kafka).context("failed to create kafka producer")?;

    let processor = Arc::new(EventProcessor::new(
        config.retry,
        Arc::new(publisher.clone()),
        ledger,
        Arc::clone(&metrics),
    ));

    let consumer = RabbitMqConsumer::connect(&config, processor, Arc::clone(&metrics))
        .await
        .context("failed to create consumer")?;

    // Health and metrics server
    tokio::spawn({
        let metrics = Arc::clone(&metrics);
        async move {
            if let Err(e) = health::serve(health::BIND_ADDR, metrics).await {
                error!(error = %e, "health/metrics server failed");
            }
        }
    });

    // Graceful shutdown on SIGINT/SIGTERM
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("shutdown signal received, stopping...");
            cancel.cancel();
        }
    });

    info!("starting event bridge service...");
    if let Err(e) = consumer.start(cancel).await {
        error!(error = %e, "consumer failure");
    }

    if let Err(e) = publisher.flush(Duration::from_secs(10)) {
        error!(error = %e, "failed to flush kafka producer on shutdown");
    }

    info!("service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to register SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
