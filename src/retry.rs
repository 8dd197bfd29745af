// ============================================================================
// Retry Envelope
// ============================================================================
//
// Bounded exponential back-off around a fallible async operation, under a
// cancellation scope. The attempt budget counts invocations, first try
// included. Only the last error is surfaced.
//
// ============================================================================

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;

/// Classification consulted between attempts. Errors that will fail the same
/// way every time report false and end the loop immediately.
pub trait RetryableError {
    fn is_retryable(&self) -> bool;
}

/// The last error observed once the attempt budget is spent, the error is
/// non-retryable, or the scope is cancelled.
#[derive(Debug, Error)]
#[error("gave up after {attempts} attempt(s): {source}")]
pub struct RetryExhausted<E>
where
    E: std::error::Error + 'static,
{
    pub attempts: u32,
    #[source]
    pub source: E,
}

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Maximum invocations of the operation, first attempt included
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self {
            max_attempts: config.max_retries,
            initial_delay: config.initial_delay,
            max_delay: config.max_delay,
        }
    }
}

impl RetryPolicy {
    /// Delay inserted after the n-th failed attempt (1-based):
    /// min(initial * 2^(n-1), max).
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        self.initial_delay
            .saturating_mul(1 << exp)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, the attempt budget is spent, a
    /// non-retryable error occurs, or `cancel` fires.
    ///
    /// Cancellation aborts the back-off wait and surfaces the last observed
    /// error without a further attempt. `on_retry` is invoked once per failed
    /// attempt that will be retried.
    pub async fn run<T, E, F, Fut, R>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
        mut on_retry: R,
    ) -> Result<T, RetryExhausted<E>>
    where
        E: std::error::Error + RetryableError + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: FnMut(u32, &E),
    {
        let mut attempt = 1u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= self.max_attempts
                        || !err.is_retryable()
                        || cancel.is_cancelled()
                    {
                        return Err(RetryExhausted {
                            attempts: attempt,
                            source: err,
                        });
                    }
                    on_retry(attempt, &err);

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(RetryExhausted {
                                attempts: attempt,
                                source: err,
                            });
                        }
                        _ = tokio::time::sleep(self.backoff(attempt)) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}
