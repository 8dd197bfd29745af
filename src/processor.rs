// ============================================================================
// Event Processor
// ============================================================================
//
// Orchestrates one event: ledger check, publish under retry + circuit
// breaker, ledger mark. The downstream record is durable before the ledger
// mark, so a crash between the two leaves a redeliverable event whose
// re-publish collapses downstream under the event-id key.
//
// ============================================================================

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::RetryConfig;
use crate::error::ProcessError;
use crate::event::Event;
use crate::idempotency::IdempotencyLedger;
use crate::kafka::circuit_breaker::{BreakerConfig, CircuitBreaker, State};
use crate::kafka::producer::EventPublisher;
use crate::metrics::Metrics;
use crate::retry::RetryPolicy;

/// Completion marks outlive the upstream's maximum redelivery window.
const LEDGER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Breaker name, also the label on the state gauge
const BREAKER_NAME: &str = "kafka-publisher";

pub struct EventProcessor {
    publisher: Arc<dyn EventPublisher>,
    ledger: Arc<dyn IdempotencyLedger>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl EventProcessor {
    pub fn new(
        retry: RetryConfig,
        publisher: Arc<dyn EventPublisher>,
        ledger: Arc<dyn IdempotencyLedger>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let gauge = metrics.circuit_breaker_state.clone();
        let breaker = CircuitBreaker::new(BREAKER_NAME, BreakerConfig::default())
            .with_on_state_change(move |name, state| {
                gauge.with_label_values(&[name]).set(state.as_gauge());
            });
        metrics
            .circuit_breaker_state
            .with_label_values(&[BREAKER_NAME])
            .set(State::Closed.as_gauge());

        Self {
            publisher,
            ledger,
            breaker: Arc::new(breaker),
            retry: retry.into(),
            metrics,
        }
    }

    /// Process one event to completion or to a retryable error.
    ///
    /// Ok means the event's downstream effect exists and is marked complete;
    /// the caller should ack. Any Err means the delivery must be requeued.
    pub async fn process(
        &self,
        cancel: &CancellationToken,
        event: &Event,
    ) -> Result<(), ProcessError> {
        self.metrics.in_flight_events.inc();
        let timer = self.metrics.processing_duration_seconds.start_timer();

        let result = self.process_inner(cancel, event).await;

        timer.observe_duration();
        self.metrics.in_flight_events.dec();
        result
    }

    async fn process_inner(
        &self,
        cancel: &CancellationToken,
        event: &Event,
    ) -> Result<(), ProcessError> {
        // 1. Idempotency check
        let processed = self
            .ledger
            .is_processed(&event.id)
            .await
            .map_err(ProcessError::Ledger)?;
        if processed {
            info!(
                event_id = %event.id,
                correlation_id = %event.correlation_id,
                "event already processed, skipping"
            );
            return Ok(());
        }

        // 2. Publish with circuit breaker and retries
        let publish = {
            let publisher = Arc::clone(&self.publisher);
            let breaker = Arc::clone(&self.breaker);
            let event = event.clone();
            move || {
                let publisher = Arc::clone(&publisher);
                let breaker = Arc::clone(&breaker);
                let event = event.clone();
                async move { breaker.call(publisher.publish(&event)).await }
            }
        };
        self.retry
            .run(cancel, publish, |attempt, err| {
                self.metrics.retry_attempts_total.inc();
                warn!(
                    event_id = %event.id,
                    attempt,
                    error = %err,
                    "publish failed, retrying"
                );
            })
            .await
            .map_err(|err| {
                self.metrics.dead_letter_total.inc();
                error!(
                    event_id = %event.id,
                    correlation_id = %event.correlation_id,
                    attempts = err.attempts,
                    error = %err.source,
                    "all publish attempts failed"
                );
                ProcessError::PublishExhausted(err)
            })?;
        self.metrics.events_published_total.inc();

        // 3. Mark as processed. The record is already durable downstream; a
        // mark failure sends the delivery back upstream and the next pass
        // either sees the mark or re-publishes under the same key.
        self.ledger
            .mark_processed(&event.id, LEDGER_TTL)
            .await
            .map_err(|err| {
                error!(event_id = %event.id, error = %err, "failed to mark event as processed");
                ProcessError::Mark(err)
            })?;

        info!(
            event_id = %event.id,
            correlation_id = %event.correlation_id,
            "event processed successfully"
        );
        Ok(())
    }

    /// Breaker handle, exposed for monitoring and tests.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}
