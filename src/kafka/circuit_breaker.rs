// ============================================================================
// Circuit Breaker for the Kafka Publisher
// ============================================================================
//
// Rate-aware gate shared by every worker. One instance guards one publisher.
//
// States:
// - CLOSED: calls flow through; the failure counters reset every `interval`
// - OPEN: calls are rejected immediately; after `timeout` the breaker probes
// - HALF_OPEN: up to `max_requests` concurrent probes; one failure re-opens,
//   `max_requests` consecutive successes close
//
// All transitions are linearised behind a single mutex. A generation counter
// keeps results of calls that started before a transition from polluting the
// counters of the new state.
//
// ============================================================================

use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Probe budget while half-open
    pub max_requests: u32,
    /// Window after which the closed-state counters reset
    pub interval: Duration,
    /// Cooldown before an open breaker starts probing
    pub timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_requests: 5,
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

impl State {
    /// Gauge encoding: 0 = closed, 1 = open, 2 = half-open
    pub fn as_gauge(self) -> i64 {
        match self {
            State::Closed => 0,
            State::Open => 1,
            State::HalfOpen => 2,
        }
    }
}

/// Counters over the current window or half-open episode
#[derive(Debug, Clone, Copy, Default)]
pub struct Counts {
    pub requests: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
}

impl Counts {
    pub fn failure_ratio(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        f64::from(self.total_failures) / f64::from(self.requests)
    }
}

/// Circuit breaker error types
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// Rejected without invoking the operation
    #[error("circuit breaker is open")]
    Open,

    /// The operation itself failed
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

struct Inner {
    state: State,
    counts: Counts,
    generation: u64,
    expiry: Option<Instant>,
}

impl Inner {
    /// Reset counters for a fresh window / episode of the current state.
    fn new_generation(&mut self, now: Instant, config: &BreakerConfig) {
        self.generation = self.generation.wrapping_add(1);
        self.counts = Counts::default();
        self.expiry = match self.state {
            State::Closed => {
                (config.interval > Duration::ZERO).then(|| now + config.interval)
            }
            State::Open => Some(now + config.timeout),
            State::HalfOpen => None,
        };
    }
}

type TripPredicate = Box<dyn Fn(Counts) -> bool + Send + Sync>;
type StateChangeHook = Box<dyn Fn(&str, State) + Send + Sync>;

/// Thread-safe circuit breaker around an async operation.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    ready_to_trip: TripPredicate,
    on_state_change: Option<StateChangeHook>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a breaker that trips once at least 3 requests were seen in the
    /// window and 60% or more of them failed.
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let expiry =
            (config.interval > Duration::ZERO).then(|| Instant::now() + config.interval);
        Self {
            name: name.into(),
            config,
            ready_to_trip: Box::new(|counts| {
                counts.requests >= 3 && counts.failure_ratio() >= 0.6
            }),
            on_state_change: None,
            inner: Mutex::new(Inner {
                state: State::Closed,
                counts: Counts::default(),
                generation: 0,
                expiry,
            }),
        }
    }

    /// Replace the trip predicate evaluated after each failure while closed.
    pub fn with_ready_to_trip(
        mut self,
        predicate: impl Fn(Counts) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.ready_to_trip = Box::new(predicate);
        self
    }

    /// Observe state transitions (e.g. to drive a gauge). Invoked while the
    /// breaker lock is held; must not call back into the breaker.
    pub fn with_on_state_change(
        mut self,
        hook: impl Fn(&str, State) + Send + Sync + 'static,
    ) -> Self {
        self.on_state_change = Some(Box::new(hook));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute `op` under breaker protection.
    ///
    /// When the breaker is open, or its half-open probe budget is exhausted,
    /// the operation future is dropped unpolled and `BreakerError::Open` is
    /// returned immediately.
    pub async fn call<F, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        let Some(generation) = self.before_call().await else {
            warn!(breaker = %self.name, "circuit breaker open, rejecting call");
            return Err(BreakerError::Open);
        };

        match op.await {
            Ok(value) => {
                self.after_call(generation, true).await;
                Ok(value)
            }
            Err(err) => {
                self.after_call(generation, false).await;
                Err(BreakerError::Inner(err))
            }
        }
    }

    /// Current state, with expired windows and cooldowns rolled forward.
    pub async fn state(&self) -> State {
        let mut inner = self.inner.lock().await;
        self.roll(&mut inner, Instant::now());
        inner.state
    }

    /// Counters of the current window (for monitoring and tests).
    pub async fn counts(&self) -> Counts {
        let mut inner = self.inner.lock().await;
        self.roll(&mut inner, Instant::now());
        inner.counts
    }

    async fn before_call(&self) -> Option<u64> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        self.roll(&mut inner, now);

        match inner.state {
            State::Open => None,
            State::HalfOpen if inner.counts.requests >= self.config.max_requests => None,
            _ => {
                inner.counts.requests += 1;
                Some(inner.generation)
            }
        }
    }

    async fn after_call(&self, generation: u64, success: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        self.roll(&mut inner, now);

        // The window rolled or the state changed since this call was admitted.
        if inner.generation != generation {
            return;
        }

        if success {
            inner.counts.consecutive_successes += 1;
            if inner.state == State::HalfOpen
                && inner.counts.consecutive_successes >= self.config.max_requests
            {
                self.transition(&mut inner, State::Closed, now);
            }
        } else {
            inner.counts.total_failures += 1;
            inner.counts.consecutive_successes = 0;
            match inner.state {
                State::Closed if (self.ready_to_trip)(inner.counts) => {
                    self.transition(&mut inner, State::Open, now);
                }
                State::HalfOpen => {
                    self.transition(&mut inner, State::Open, now);
                }
                _ => {}
            }
        }
    }

    /// Roll expired windows forward: counter reset while closed, open to
    /// half-open once the cooldown elapsed.
    fn roll(&self, inner: &mut Inner, now: Instant) {
        match inner.state {
            State::Closed => {
                if inner.expiry.is_some_and(|expiry| now >= expiry) {
                    inner.new_generation(now, &self.config);
                }
            }
            State::Open => {
                if inner.expiry.is_some_and(|expiry| now >= expiry) {
                    self.transition(inner, State::HalfOpen, now);
                }
            }
            State::HalfOpen => {}
        }
    }

    fn transition(&self, inner: &mut Inner, to: State, now: Instant) {
        if inner.state == to {
            return;
        }
        let from = inner.state;
        inner.state = to;
        inner.new_generation(now, &self.config);

        info!(breaker = %self.name, from = ?from, to = ?to, "circuit breaker state change");
        if let Some(hook) = &self.on_state_change {
            hook(&self.name, to);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Error)]
    #[error("simulated failure")]
    struct TestError;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            max_requests: 2,
            interval: Duration::from_secs(10),
            timeout: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn test_closed_on_success() {
        let cb = CircuitBreaker::new("test", BreakerConfig::default());

        let result = cb.call(async { Ok::<_, TestError>(42) }).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.state().await, State::Closed);
        let counts = cb.counts().await;
        assert_eq!(counts.requests, 1);
        assert_eq!(counts.total_failures, 0);
        assert_eq!(counts.consecutive_successes, 1);
    }

    #[tokio::test]
    async fn test_trips_on_failure_ratio() {
        let cb = CircuitBreaker::new("test", BreakerConfig::default());

        // fail, succeed, fail: 3 requests, 2 failures, ratio 0.67
        let _ = cb.call(async { Err::<i32, _>(TestError) }).await;
        let _ = cb.call(async { Ok::<_, TestError>(1) }).await;
        assert_eq!(cb.state().await, State::Closed);
        let _ = cb.call(async { Err::<i32, _>(TestError) }).await;

        assert_eq!(cb.state().await, State::Open);

        // rejected without executing the operation
        let executed = Arc::new(AtomicU32::new(0));
        let result = cb
            .call({
                let executed = executed.clone();
                async move {
                    executed.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, TestError>(1)
                }
            })
            .await;

        assert!(matches!(result, Err(BreakerError::Open)));
        assert_eq!(executed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_does_not_trip_below_request_floor() {
        let cb = CircuitBreaker::new("test", BreakerConfig::default());

        // 2 failures out of 2 requests: ratio 1.0 but below the 3-request floor
        let _ = cb.call(async { Err::<i32, _>(TestError) }).await;
        let _ = cb.call(async { Err::<i32, _>(TestError) }).await;

        assert_eq!(cb.state().await, State::Closed);
    }

    #[tokio::test]
    async fn test_closed_counters_reset_every_interval() {
        let cb = CircuitBreaker::new(
            "test",
            BreakerConfig {
                max_requests: 2,
                interval: Duration::from_millis(50),
                timeout: Duration::from_secs(30),
            },
        );

        let _ = cb.call(async { Err::<i32, _>(TestError) }).await;
        assert_eq!(cb.counts().await.requests, 1);

        tokio::time::sleep(Duration::from_millis(60)).await;

        let counts = cb.counts().await;
        assert_eq!(counts.requests, 0);
        assert_eq!(counts.total_failures, 0);
        assert_eq!(cb.state().await, State::Closed);
    }

    #[tokio::test]
    async fn test_half_open_recovery() {
        let cb = CircuitBreaker::new("test", fast_config())
            .with_ready_to_trip(|counts| counts.total_failures >= 1);

        let _ = cb.call(async { Err::<i32, _>(TestError) }).await;
        assert_eq!(cb.state().await, State::Open);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(cb.state().await, State::HalfOpen);

        // max_requests consecutive successes close the breaker
        for _ in 0..2 {
            let result = cb.call(async { Ok::<_, TestError>(1) }).await;
            assert!(result.is_ok());
        }
        assert_eq!(cb.state().await, State::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new("test", fast_config())
            .with_ready_to_trip(|counts| counts.total_failures >= 1);

        let _ = cb.call(async { Err::<i32, _>(TestError) }).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(cb.state().await, State::HalfOpen);

        let _ = cb.call(async { Err::<i32, _>(TestError) }).await;
        assert_eq!(cb.state().await, State::Open);
    }

    #[tokio::test]
    async fn test_half_open_limits_concurrent_probes() {
        let cb = Arc::new(
            CircuitBreaker::new(
                "test",
                BreakerConfig {
                    max_requests: 1,
                    interval: Duration::from_secs(10),
                    timeout: Duration::from_millis(50),
                },
            )
            .with_ready_to_trip(|counts| counts.total_failures >= 1),
        );

        let _ = cb.call(async { Err::<i32, _>(TestError) }).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cb.state().await, State::HalfOpen);

        // first probe occupies the half-open budget until released
        let gate = Arc::new(tokio::sync::Notify::new());
        let probe = tokio::spawn({
            let cb = cb.clone();
            let gate = gate.clone();
            async move {
                cb.call(async move {
                    gate.notified().await;
                    Ok::<_, TestError>(1)
                })
                .await
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = cb.call(async { Ok::<_, TestError>(1) }).await;
        assert!(matches!(second, Err(BreakerError::Open)));

        gate.notify_one();
        assert!(probe.await.unwrap().is_ok());
        assert_eq!(cb.state().await, State::Closed);
    }

    #[tokio::test]
    async fn test_state_change_hook_fires() {
        let transitions = Arc::new(std::sync::Mutex::new(Vec::new()));
        let cb = CircuitBreaker::new("hooked", fast_config())
            .with_ready_to_trip(|counts| counts.total_failures >= 1)
            .with_on_state_change({
                let transitions = transitions.clone();
                move |name, state| {
                    transitions.lock().unwrap().push((name.to_string(), state));
                }
            });

        let _ = cb.call(async { Err::<i32, _>(TestError) }).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        let _ = cb.call(async { Ok::<_, TestError>(1) }).await;
        let _ = cb.call(async { Ok::<_, TestError>(1) }).await;

        let seen = transitions.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                ("hooked".to_string(), State::Open),
                ("hooked".to_string(), State::HalfOpen),
                ("hooked".to_string(), State::Closed),
            ]
        );
    }

    #[tokio::test]
    async fn test_concurrent_successes_stay_closed() {
        let cb = Arc::new(CircuitBreaker::new("test", BreakerConfig::default()));
        let mut handles = vec![];

        for i in 0..50 {
            let cb = cb.clone();
            handles.push(tokio::spawn(async move {
                cb.call(async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok::<_, TestError>(i)
                })
                .await
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(cb.state().await, State::Closed);
    }
}
