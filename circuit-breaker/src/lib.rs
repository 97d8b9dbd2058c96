//! Three-state circuit breaker (`CLOSED` / `OPEN` / `HALF_OPEN`) guarding a
//! single call site. `rpc-cache-proxy` wires exactly one shared instance
//! around its whole multi-URL `UpstreamClient`, distinct from that client's
//! own per-URL health tracking.

use derive_more::Display;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout: Duration,
    pub reset_timeout: Duration,
    pub volume_threshold: u32,
    pub error_threshold_percentage: f64,
    pub window_size: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_millis(10_000),
            reset_timeout: Duration::from_millis(60_000),
            volume_threshold: 10,
            error_threshold_percentage: 50.0,
            window_size: Duration::from_millis(60_000),
        }
    }
}

#[derive(Debug, Display)]
pub enum CircuitBreakerError<E: std::fmt::Debug + std::fmt::Display> {
    #[display(fmt = "circuit breaker open")]
    Open,
    #[display(fmt = "call timed out after {_0:?}")]
    Timeout(Duration),
    #[display(fmt = "{_0}")]
    Inner(E),
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for CircuitBreakerError<E> {}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    next_attempt: Instant,
    window: VecDeque<(Instant, bool)>,
}

pub type TransitionHook = Arc<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    on_transition: Option<TransitionHook>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_successes: u32,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_hook(config, None)
    }

    pub fn with_hook(config: CircuitBreakerConfig, on_transition: Option<TransitionHook>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                next_attempt: Instant::now(),
                window: VecDeque::new(),
            }),
            config,
            on_transition,
        }
    }

    /// Current state, applying the lazy `OPEN -> HALF_OPEN` transition if
    /// `nextAttempt` has passed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner);
        inner.state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner);
        CircuitBreakerStats {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            half_open_successes: inner.half_open_successes,
        }
    }

    pub fn trip(&self) {
        let mut inner = self.inner.lock();
        self.transition_to_open(&mut inner);
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Closed);
        inner.consecutive_failures = 0;
        inner.half_open_successes = 0;
        inner.window.clear();
    }

    pub fn attempt_reset(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Open {
            self.transition(&mut inner, CircuitState::HalfOpen);
            inner.half_open_successes = 0;
        }
    }

    /// Run `fut` if the breaker currently admits calls; record the outcome.
    pub async fn call<F, T, E>(&self, fut: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
        E: std::fmt::Debug + std::fmt::Display,
    {
        {
            let mut inner = self.inner.lock();
            self.maybe_half_open(&mut inner);
            if inner.state == CircuitState::Open {
                return Err(CircuitBreakerError::Open);
            }
        }

        match tokio::time::timeout(self.config.timeout, fut).await {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Ok(Err(err)) => {
                self.record_failure();
                Err(CircuitBreakerError::Inner(err))
            }
            Err(_) => {
                self.record_failure();
                Err(CircuitBreakerError::Timeout(self.config.timeout))
            }
        }
    }

    fn maybe_half_open(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open && Instant::now() >= inner.next_attempt {
            self.transition(inner, CircuitState::HalfOpen);
            inner.half_open_successes = 0;
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        push_sample(&mut inner.window, self.config.window_size, now, true);

        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                    inner.consecutive_failures = 0;
                    inner.half_open_successes = 0;
                    inner.window.clear();
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        push_sample(&mut inner.window, self.config.window_size, now, false);

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                let tripped_by_consecutive =
                    inner.consecutive_failures >= self.config.failure_threshold;
                let tripped_by_ratio = inner.window.len() as u32 >= self.config.volume_threshold
                    && failure_percentage(&inner.window) >= self.config.error_threshold_percentage;
                if tripped_by_consecutive || tripped_by_ratio {
                    self.transition_to_open(&mut inner);
                }
            }
            CircuitState::HalfOpen => self.transition_to_open(&mut inner),
            CircuitState::Open => {}
        }
    }

    fn transition_to_open(&self, inner: &mut Inner) {
        self.transition(inner, CircuitState::Open);
        inner.next_attempt = Instant::now() + self.config.reset_timeout;
        inner.consecutive_failures = 0;
        inner.half_open_successes = 0;
        inner.window.clear();
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        match to {
            CircuitState::Open => warn!(?from, ?to, "circuit breaker tripped open"),
            _ => debug!(?from, ?to, "circuit breaker transition"),
        }
        if let Some(hook) = &self.on_transition {
            hook(from, to);
        }
    }
}

fn push_sample(window: &mut VecDeque<(Instant, bool)>, window_size: Duration, now: Instant, ok: bool) {
    window.push_back((now, ok));
    while let Some((ts, _)) = window.front() {
        if now.duration_since(*ts) > window_size {
            window.pop_front();
        } else {
            break;
        }
    }
}

fn failure_percentage(window: &VecDeque<(Instant, bool)>) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    let failures = window.iter().filter(|(_, ok)| !ok).count();
    (failures as f64 / window.len() as f64) * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold,
            success_threshold: 2,
            timeout: Duration::from_millis(200),
            reset_timeout: Duration::from_millis(50),
            volume_threshold: 1000, // disable ratio-based tripping in these tests
            error_threshold_percentage: 100.0,
            window_size: Duration::from_secs(60),
        })
    }

    #[tokio::test]
    async fn trips_after_consecutive_failures() {
        let cb = breaker(3);
        for _ in 0..3 {
            let _ = cb.call(async { Err::<(), _>("boom") }).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn rejects_without_invoking_upstream_while_open() {
        let cb = breaker(1);
        let _ = cb.call(async { Err::<(), _>("boom") }).await;
        assert_eq!(cb.state(), CircuitState::Open);

        let mut invoked = false;
        let result = cb
            .call(async {
                invoked = true;
                Ok::<_, &str>(())
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::Open)));
        assert!(!invoked);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens_and_success_closes() {
        let cb = breaker(1);
        let _ = cb.call(async { Err::<(), _>("boom") }).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let _ = cb.call(async { Err::<(), _>("boom again") }).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        let _ = cb.call(async { Ok::<_, &str>(()) }).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        let _ = cb.call(async { Ok::<_, &str>(()) }).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn per_call_timeout_counts_as_failure() {
        let cb = breaker(1);
        let result = cb
            .call(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<(), &str>(())
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::Timeout(_))));
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn manual_trip_and_reset() {
        let cb = breaker(5);
        cb.trip();
        assert_eq!(cb.state(), CircuitState::Open);
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
