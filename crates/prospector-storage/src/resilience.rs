//! Retry with exponential backoff plus per-dependency circuit breakers.
//!
//! Every network-touching call goes through [`ResilientExecutor::call`]. The
//! registry is built once per process and shared, so failures from unrelated
//! call sites that hit the same dependency aggregate into one circuit.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::clock::{Clock, Sleeper, SystemClock, TokioSleeper};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Implemented by every error an external call can produce.
pub trait Classify {
    fn disposition(&self) -> RetryDisposition;
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total calls made before giving up, the first one included.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Delay after the failure of the zero-based `attempt_index`-th call.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub half_open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    failures: u32,
    last_failure_at: Option<DateTime<Utc>>,
    state: CircuitState,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            failures: 0,
            last_failure_at: None,
            state: CircuitState::Closed,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn last_failure_at(&self) -> Option<DateTime<Utc>> {
        self.last_failure_at
    }

    fn since_last_failure_at_least(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match self.last_failure_at {
            Some(at) => (now - at).to_std().map(|elapsed| elapsed >= window).unwrap_or(false),
            None => true,
        }
    }

    /// Whether a call may go through right now. Moves an open circuit to
    /// half-open once the reset timeout has passed.
    pub fn can_execute(&mut self, now: DateTime<Utc>) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.since_last_failure_at_least(now, self.config.reset_timeout) {
                    self.state = CircuitState::HalfOpen;
                    info!(dependency = %self.name, "circuit breaker half-open, probing");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                self.since_last_failure_at_least(now, self.config.half_open_timeout)
            }
        }
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.failures = self.failures.saturating_add(1);
        self.last_failure_at = Some(now);

        let reopen = self.state == CircuitState::HalfOpen;
        if reopen || self.failures >= self.config.failure_threshold {
            if self.state != CircuitState::Open {
                warn!(
                    dependency = %self.name,
                    failures = self.failures,
                    "circuit breaker opened"
                );
            }
            self.state = CircuitState::Open;
        }
    }

    pub fn record_success(&mut self) {
        if self.state != CircuitState::Closed {
            info!(dependency = %self.name, "circuit breaker reset to closed");
        }
        self.state = CircuitState::Closed;
        self.failures = 0;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub dependency: String,
    pub state: CircuitState,
    pub failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// Process-wide set of breakers keyed by dependency name.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    breakers: Mutex<BTreeMap<String, CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            breakers: Mutex::new(BTreeMap::new()),
        }
    }

    fn with_breaker<R>(&self, name: &str, f: impl FnOnce(&mut CircuitBreaker, DateTime<Utc>) -> R) -> R {
        let now = self.clock.now();
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        let breaker = breakers
            .entry(name.to_string())
            .or_insert_with(|| CircuitBreaker::new(name, self.config));
        f(breaker, now)
    }

    pub fn can_execute(&self, name: &str) -> bool {
        self.with_breaker(name, |breaker, now| breaker.can_execute(now))
    }

    pub fn record_failure(&self, name: &str) {
        self.with_breaker(name, |breaker, now| breaker.record_failure(now));
    }

    pub fn record_success(&self, name: &str) {
        self.with_breaker(name, |breaker, _| breaker.record_success());
    }

    pub fn state(&self, name: &str) -> CircuitState {
        self.with_breaker(name, |breaker, _| breaker.state())
    }

    pub fn failures(&self, name: &str) -> u32 {
        self.with_breaker(name, |breaker, _| breaker.failures())
    }

    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers
            .iter()
            .map(|(name, breaker)| CircuitSnapshot {
                dependency: name.clone(),
                state: breaker.state(),
                failures: breaker.failures(),
                last_failure_at: breaker.last_failure_at(),
            })
            .collect()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[derive(Debug, Error)]
pub enum ResilienceError<E> {
    #[error("circuit breaker '{dependency}' is open, request blocked")]
    CircuitOpen { dependency: String },
    #[error("{dependency} call failed after {attempts} attempts: {source}")]
    Exhausted {
        dependency: String,
        attempts: usize,
        #[source]
        source: E,
    },
    #[error("{dependency} call failed with a non-retryable error: {source}")]
    Fatal {
        dependency: String,
        #[source]
        source: E,
    },
}

impl<E> ResilienceError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ResilienceError::CircuitOpen { .. })
    }

    pub fn dependency(&self) -> &str {
        match self {
            ResilienceError::CircuitOpen { dependency }
            | ResilienceError::Exhausted { dependency, .. }
            | ResilienceError::Fatal { dependency, .. } => dependency,
        }
    }

    pub fn operation_error(&self) -> Option<&E> {
        match self {
            ResilienceError::CircuitOpen { .. } => None,
            ResilienceError::Exhausted { source, .. } | ResilienceError::Fatal { source, .. } => {
                Some(source)
            }
        }
    }
}

/// Bounded retry loop gated by the dependency's circuit breaker.
#[derive(Clone)]
pub struct ResilientExecutor {
    breakers: Arc<CircuitBreakerRegistry>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl ResilientExecutor {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>, policy: RetryPolicy) -> Self {
        Self {
            breakers,
            policy,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn call<T, E, F, Fut>(
        &self,
        dependency: &str,
        mut operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt_index = 0usize;

        loop {
            if !self.breakers.can_execute(dependency) {
                return Err(ResilienceError::CircuitOpen {
                    dependency: dependency.to_string(),
                });
            }

            let err = match operation().await {
                Ok(value) => {
                    self.breakers.record_success(dependency);
                    return Ok(value);
                }
                Err(err) => err,
            };
            self.breakers.record_failure(dependency);

            if err.disposition() == RetryDisposition::NonRetryable {
                return Err(ResilienceError::Fatal {
                    dependency: dependency.to_string(),
                    source: err,
                });
            }

            let attempts = attempt_index + 1;
            if attempts >= max_attempts {
                warn!(dependency, attempts, error = %err, "giving up after final attempt");
                return Err(ResilienceError::Exhausted {
                    dependency: dependency.to_string(),
                    attempts,
                    source: err,
                });
            }
            if self.breakers.state(dependency) == CircuitState::Open {
                warn!(dependency, attempts, error = %err, "circuit opened mid-retry, giving up");
                return Err(ResilienceError::Exhausted {
                    dependency: dependency.to_string(),
                    attempts,
                    source: err,
                });
            }

            let delay = self.policy.delay_for_attempt(attempt_index);
            warn!(
                dependency,
                attempt = attempts + 1,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying after transient failure"
            );
            self.sleeper.sleep(delay).await;
            attempt_index += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct FakeError(RetryDisposition);

    impl Display for FakeError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "fake {:?}", self.0)
        }
    }

    impl Classify for FakeError {
        fn disposition(&self) -> RetryDisposition {
            self.0
        }
    }

    #[derive(Default)]
    struct RecordingSleeper {
        slept: Mutex<Vec<Duration>>,
    }

    #[async_trait::async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.slept.lock().unwrap().push(duration);
        }
    }

    fn start() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn backoff_doubles_from_base_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(20));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(80));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(300));
    }

    #[test]
    fn breaker_opens_after_threshold_and_recovers_through_half_open() {
        let clock = Arc::new(ManualClock::new(start()));
        let registry = CircuitBreakerRegistry::with_clock(CircuitBreakerConfig::default(), clock.clone());

        for _ in 0..4 {
            registry.record_failure("model");
        }
        assert!(registry.can_execute("model"));
        registry.record_failure("model");
        assert_eq!(registry.state("model"), CircuitState::Open);
        assert!(!registry.can_execute("model"));

        clock.advance(Duration::from_secs(59));
        assert!(!registry.can_execute("model"));
        clock.advance(Duration::from_secs(1));
        assert!(registry.can_execute("model"));
        assert_eq!(registry.state("model"), CircuitState::HalfOpen);

        registry.record_success("model");
        assert_eq!(registry.state("model"), CircuitState::Closed);
        assert_eq!(registry.failures("model"), 0);
    }

    #[test]
    fn half_open_failure_reopens_and_restarts_window() {
        let clock = Arc::new(ManualClock::new(start()));
        let registry = CircuitBreakerRegistry::with_clock(CircuitBreakerConfig::default(), clock.clone());
        for _ in 0..5 {
            registry.record_failure("webhook");
        }
        clock.advance(Duration::from_secs(60));
        assert!(registry.can_execute("webhook"));

        registry.record_failure("webhook");
        assert_eq!(registry.state("webhook"), CircuitState::Open);
        clock.advance(Duration::from_secs(30));
        assert!(!registry.can_execute("webhook"));
        clock.advance(Duration::from_secs(30));
        assert!(registry.can_execute("webhook"));
    }

    #[test]
    fn breakers_are_independent_per_dependency() {
        let registry = CircuitBreakerRegistry::default();
        for _ in 0..5 {
            registry.record_failure("webhook");
        }
        assert!(!registry.can_execute("webhook"));
        assert!(registry.can_execute("model"));
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].dependency, "model");
        assert_eq!(snapshot[1].state, CircuitState::Open);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_with_backoff() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let executor = ResilientExecutor::new(Arc::new(CircuitBreakerRegistry::default()), RetryPolicy::default())
            .with_sleeper(sleeper.clone());
        let calls = AtomicUsize::new(0);

        let result: Result<&str, _> = executor
            .call("model", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(FakeError(RetryDisposition::Retryable))
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            *sleeper.slept.lock().unwrap(),
            vec![Duration::from_secs(10), Duration::from_secs(20)]
        );
        assert_eq!(executor.breakers().failures("model"), 0);
    }

    #[tokio::test]
    async fn non_retryable_failure_propagates_immediately() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let executor = ResilientExecutor::new(Arc::new(CircuitBreakerRegistry::default()), RetryPolicy::default())
            .with_sleeper(sleeper.clone());
        let calls = AtomicUsize::new(0);

        let result: Result<(), _> = executor
            .call("model", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FakeError(RetryDisposition::NonRetryable)) }
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::Fatal { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(sleeper.slept.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_surface_last_error_and_open_the_circuit() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let executor = ResilientExecutor::new(Arc::new(CircuitBreakerRegistry::default()), RetryPolicy::default())
            .with_sleeper(sleeper.clone());

        let result: Result<(), _> = executor
            .call("webhook", || async { Err(FakeError(RetryDisposition::Retryable)) })
            .await;
        match result {
            Err(ResilienceError::Exhausted { attempts, .. }) => assert_eq!(attempts, 5),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(sleeper.slept.lock().unwrap().len(), 4);

        let calls = AtomicUsize::new(0);
        let rejected: Result<(), ResilienceError<FakeError>> = executor
            .call("webhook", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        let err = rejected.unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(err.dependency(), "webhook");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn circuit_opening_mid_retry_stops_without_sleeping() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let breakers = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 2,
            ..CircuitBreakerConfig::default()
        });
        let executor = ResilientExecutor::new(Arc::new(breakers), RetryPolicy::default())
            .with_sleeper(sleeper.clone());
        let calls = AtomicUsize::new(0);

        let result: Result<(), _> = executor
            .call("model", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FakeError(RetryDisposition::Retryable)) }
            })
            .await;

        match result {
            Err(ResilienceError::Exhausted { attempts, source, .. }) => {
                assert_eq!(attempts, 2);
                assert_eq!(source.to_string(), "fake Retryable");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(*sleeper.slept.lock().unwrap(), vec![Duration::from_secs(10)]);
        assert_eq!(executor.breakers().state("model"), CircuitState::Open);
    }
}
