use thiserror::Error;

use crate::kafka::circuit_breaker::BreakerError;
use crate::retry::{RetryExhausted, RetryableError};

/// Errors surfaced by the downstream publisher.
///
/// Serialisation failures are permanent: the same payload fails the same way
/// on every attempt, so the retry envelope must not spend budget on them.
/// Transport failures are transient and retried.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("kafka send failed: {0}")]
    Transport(String),
}

impl PublishError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, PublishError::Serialize(_))
    }
}

impl RetryableError for BreakerError<PublishError> {
    fn is_retryable(&self) -> bool {
        match self {
            // An open breaker is a transient downstream condition.
            BreakerError::Open => true,
            BreakerError::Inner(err) => !err.is_permanent(),
        }
    }
}

/// Terminal outcome of processing one event, surfaced to the consumer.
///
/// Every variant is translated into a requeue upstream; none of them drops a
/// delivery.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("idempotency check failed: {0}")]
    Ledger(#[source] anyhow::Error),

    #[error("failed after retries: {0}")]
    PublishExhausted(#[source] RetryExhausted<BreakerError<PublishError>>),

    #[error("failed to mark event as processed: {0}")]
    Mark(#[source] anyhow::Error),
}
