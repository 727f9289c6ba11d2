//! Retry executor with fixed, exponential and randomized backoff
//!
//! Attempts are numbered from 1. After a failed attempt `n` the wait is
//! `wait_duration * multiplier^(n-1)`, capped at `max_wait_duration`, then
//! perturbed by up to `±randomized_wait_factor` of itself.

use crate::classifier::{DefaultClassifier, FailureClassifier, FailureContext, PredicateClassifier};
use crate::clock::{Clock, TokioClock};
use crate::errors::{ConfigError, GuardError};
use crate::events::{DEFAULT_EVENT_BUFFER, Event, EventPublisher, RetryEventKind};
use futures::TryFutureExt;
use rand::Rng;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Retry configuration
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct RetryConfig {
    /// Total attempts including the first call
    pub max_attempts: u32,
    /// Wait after the first failed attempt
    pub wait_duration: Duration,
    /// Enables exponential backoff when set (must be >= 1.0)
    pub exponential_backoff_multiplier: Option<f64>,
    /// Upper bound for the computed wait, before jitter
    pub max_wait_duration: Option<Duration>,
    /// Enables randomized waits when set, in [0, 1]
    pub randomized_wait_factor: Option<f64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            wait_duration: Duration::from_millis(500),
            exponential_backoff_multiplier: None,
            max_wait_duration: None,
            randomized_wait_factor: None,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid(name, "max_attempts must be >= 1"));
        }
        if let Some(multiplier) = self.exponential_backoff_multiplier
            && !(multiplier.is_finite() && multiplier >= 1.0)
        {
            return Err(ConfigError::invalid(
                name,
                format!("exponential_backoff_multiplier must be >= 1.0, got {multiplier}"),
            ));
        }
        if let Some(factor) = self.randomized_wait_factor
            && !(0.0..=1.0).contains(&factor)
        {
            return Err(ConfigError::invalid(
                name,
                format!("randomized_wait_factor must be in [0, 1], got {factor}"),
            ));
        }
        Ok(())
    }

    /// Deterministic wait after failed attempt `attempt`
    pub fn interval(&self, attempt: u32) -> Duration {
        let base = self.wait_duration.as_secs_f64();
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let mut secs = match self.exponential_backoff_multiplier {
            Some(multiplier) => base * multiplier.powi(exponent),
            None => base,
        };
        if let Some(max) = self.max_wait_duration {
            secs = secs.min(max.as_secs_f64());
        }
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// Wait after failed attempt `attempt`, jitter applied
    pub fn wait_for(&self, attempt: u32) -> Duration {
        let interval = self.interval(attempt);
        match self.randomized_wait_factor {
            Some(factor) if factor > 0.0 => {
                let secs = interval.as_secs_f64();
                let delta = secs * factor;
                let jittered = rand::thread_rng().gen_range((secs - delta)..=(secs + delta));
                Duration::try_from_secs_f64(jittered.max(0.0)).unwrap_or(interval)
            }
            _ => interval,
        }
    }
}

/// Call counters of a retry instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryMetrics {
    pub successful_calls_without_retry: u64,
    pub successful_calls_with_retry: u64,
    pub failed_calls_without_retry: u64,
    pub failed_calls_with_retry: u64,
}

#[derive(Debug, Default)]
struct Counters {
    successful_without_retry: AtomicU64,
    successful_with_retry: AtomicU64,
    failed_without_retry: AtomicU64,
    failed_with_retry: AtomicU64,
}

#[derive(Debug)]
struct RetryInner {
    name: String,
    config: RetryConfig,
    classifier: Arc<dyn FailureClassifier>,
    clock: Arc<dyn Clock>,
    events: EventPublisher<RetryEventKind>,
    counters: Counters,
}

/// Re-invokes a call on retryable failures
///
/// Guard rejections ([`GuardError::CallNotPermitted`], [`GuardError::BulkheadFull`])
/// are never retried. Timeouts and execution errors are retried when the
/// classifier says they count as failures.
#[derive(Debug, Clone)]
pub struct Retry {
    inner: Arc<RetryInner>,
}

impl Retry {
    pub fn new(name: impl Into<String>, config: RetryConfig) -> Result<Self, ConfigError> {
        Self::builder(name).config(config).build()
    }

    pub fn builder(name: impl Into<String>) -> RetryBuilder {
        RetryBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &RetryConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event<RetryEventKind>> {
        self.inner.events.subscribe()
    }

    pub fn metrics(&self) -> RetryMetrics {
        let c = &self.inner.counters;
        RetryMetrics {
            successful_calls_without_retry: c.successful_without_retry.load(Ordering::Relaxed),
            successful_calls_with_retry: c.successful_with_retry.load(Ordering::Relaxed),
            failed_calls_without_retry: c.failed_without_retry.load(Ordering::Relaxed),
            failed_calls_with_retry: c.failed_with_retry.load(Ordering::Relaxed),
        }
    }

    fn is_retryable<E: Any>(&self, error: &GuardError<E>, duration: Duration) -> bool {
        let error: &dyn Any = match error {
            GuardError::CallNotPermitted(_) | GuardError::BulkheadFull(_) => return false,
            GuardError::Timeout(timeout) => timeout,
            GuardError::Execution(error) => error,
        };
        self.inner
            .classifier
            .classify(&FailureContext {
                instance: &self.inner.name,
                error,
                duration,
            })
            .counts_as_failure()
    }

    fn publish(&self, kind: RetryEventKind) {
        self.inner.events.publish(self.inner.clock.now(), kind);
    }

    /// Run `operation` until it succeeds, fails non-retryably, or attempts run out
    pub async fn execute<T, E, F, Fut>(&self, mut operation: F) -> Result<T, GuardError<E>>
    where
        E: Any,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GuardError<E>>>,
    {
        let max_attempts = self.inner.config.max_attempts;
        let counters = &self.inner.counters;
        let mut attempt: u32 = 1;

        loop {
            let started = self.inner.clock.now();
            let error = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        counters.successful_with_retry.fetch_add(1, Ordering::Relaxed);
                        debug!(retry = %self.inner.name, attempts = attempt, "Call succeeded after retry");
                        self.publish(RetryEventKind::Success { attempts: attempt });
                    } else {
                        counters.successful_without_retry.fetch_add(1, Ordering::Relaxed);
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let elapsed = self.inner.clock.now().saturating_duration_since(started);
            if !self.is_retryable(&error, elapsed) {
                if !error.is_rejection() {
                    self.publish(RetryEventKind::IgnoredError { attempt });
                }
                let counter = if attempt > 1 {
                    &counters.failed_with_retry
                } else {
                    &counters.failed_without_retry
                };
                counter.fetch_add(1, Ordering::Relaxed);
                return Err(error);
            }

            if attempt >= max_attempts {
                counters.failed_with_retry.fetch_add(1, Ordering::Relaxed);
                warn!(retry = %self.inner.name, attempts = attempt, "Retries exhausted");
                self.publish(RetryEventKind::Error { attempts: attempt });
                return Err(error);
            }

            let wait = self.inner.config.wait_for(attempt);
            debug!(retry = %self.inner.name, attempt, ?wait, "Retrying after failed attempt");
            self.publish(RetryEventKind::Retry { attempt, wait });
            self.inner.clock.sleep(wait).await;
            attempt += 1;
        }
    }

    /// Retry a plain fallible operation
    pub async fn call<T, E, F, Fut>(&self, mut operation: F) -> Result<T, GuardError<E>>
    where
        E: Any,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute(|| operation().map_err(GuardError::Execution))
            .await
    }
}

/// Builder for [`Retry`]
pub struct RetryBuilder {
    name: String,
    config: RetryConfig,
    classifier: Option<Arc<dyn FailureClassifier>>,
    clock: Option<Arc<dyn Clock>>,
    event_buffer: usize,
}

impl RetryBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: RetryConfig::default(),
            classifier: None,
            clock: None,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    pub fn config(mut self, config: RetryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn wait_duration(mut self, wait: Duration) -> Self {
        self.config.wait_duration = wait;
        self
    }

    /// Multiply the wait by `multiplier` after every failed attempt
    pub fn exponential_backoff(mut self, multiplier: f64) -> Self {
        self.config.exponential_backoff_multiplier = Some(multiplier);
        self
    }

    pub fn max_wait_duration(mut self, max: Duration) -> Self {
        self.config.max_wait_duration = Some(max);
        self
    }

    /// Perturb each wait uniformly by up to `±factor` of itself
    pub fn randomized_wait(mut self, factor: f64) -> Self {
        self.config.randomized_wait_factor = Some(factor);
        self
    }

    /// Classifier deciding which errors are retried (default: all)
    pub fn retry_on(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Retry only errors for which `predicate` returns true
    pub fn retry_if<F>(self, predicate: F) -> Self
    where
        F: Fn(&FailureContext<'_>) -> bool + Send + Sync + 'static,
    {
        self.retry_on(Arc::new(PredicateClassifier::new(predicate)))
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    pub fn build(self) -> Result<Retry, ConfigError> {
        self.config.validate(&self.name)?;
        Ok(Retry {
            inner: Arc::new(RetryInner {
                events: EventPublisher::new(&self.name, self.event_buffer),
                name: self.name,
                config: self.config,
                classifier: self.classifier.unwrap_or_else(|| Arc::new(DefaultClassifier)),
                clock: self.clock.unwrap_or_else(|| Arc::new(TokioClock)),
                counters: Counters::default(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CallNotPermitted;
    use crate::{CircuitState, TimedOut};
    use std::sync::atomic::AtomicU32;

    #[derive(Debug, PartialEq)]
    struct ServerError;

    #[derive(Debug, PartialEq)]
    struct ClientError;

    fn server_error_retry(max_attempts: u32) -> Retry {
        Retry::builder("test")
            .max_attempts(max_attempts)
            .wait_duration(Duration::from_millis(500))
            .retry_if(|ctx| ctx.error.is::<ServerError>())
            .build()
            .expect("valid config")
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_third_attempt_after_two_waits() {
        let retry = server_error_retry(3);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut events = retry.subscribe();

        let started = tokio::time::Instant::now();
        let result = retry
            .call(|| {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move { if n < 3 { Err(ServerError) } else { Ok(n) } }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(1000));
        assert!(waited < Duration::from_millis(1010));

        let kinds: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds.len(), 3);
        assert_eq!(kinds[2], RetryEventKind::Success { attempts: 3 });
        assert_eq!(retry.metrics().successful_calls_with_retry, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_attempts_return_last_error() {
        let retry = server_error_retry(3);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = retry
            .call(|| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(ServerError) }
            })
            .await;

        assert!(matches!(result, Err(GuardError::Execution(ServerError))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retry.metrics().failed_calls_with_retry, 1);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let retry = server_error_retry(5);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = retry
            .call(|| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(ClientError) }
            })
            .await;

        assert!(matches!(result, Err(GuardError::Execution(ClientError))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(retry.metrics().failed_calls_without_retry, 1);
    }

    #[tokio::test]
    async fn test_call_not_permitted_is_not_retried() {
        let retry = Retry::builder("test").max_attempts(5).build().unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), GuardError<ServerError>> = retry
            .execute(|| {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(GuardError::CallNotPermitted(CallNotPermitted {
                        circuit: "backend".to_string(),
                        state: CircuitState::Open,
                    }))
                }
            })
            .await;

        assert!(result.unwrap_err().is_call_not_permitted());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_are_retried_by_default() {
        let retry = Retry::builder("test")
            .max_attempts(2)
            .wait_duration(Duration::from_millis(10))
            .build()
            .unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), GuardError<ServerError>> = retry
            .execute(|| {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(GuardError::Timeout(TimedOut {
                        time_limiter: "slow".to_string(),
                        timeout: Duration::from_secs(1),
                    }))
                }
            })
            .await;

        assert!(result.unwrap_err().is_timeout());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let config = RetryConfig {
            wait_duration: Duration::from_millis(100),
            exponential_backoff_multiplier: Some(2.0),
            max_wait_duration: Some(Duration::from_millis(300)),
            ..Default::default()
        };

        assert_eq!(config.interval(1), Duration::from_millis(100));
        assert_eq!(config.interval(2), Duration::from_millis(200));
        assert_eq!(config.interval(3), Duration::from_millis(300));
        assert_eq!(config.interval(10), Duration::from_millis(300));
    }

    #[test]
    fn test_fixed_wait_without_multiplier() {
        let config = RetryConfig::default();
        assert_eq!(config.wait_for(1), Duration::from_millis(500));
        assert_eq!(config.wait_for(7), Duration::from_millis(500));
    }

    #[test]
    fn test_randomized_wait_within_bounds() {
        let config = RetryConfig {
            wait_duration: Duration::from_millis(500),
            randomized_wait_factor: Some(0.5),
            ..Default::default()
        };

        let samples: Vec<_> = (0..200).map(|_| config.wait_for(1)).collect();
        for wait in &samples {
            assert!(*wait >= Duration::from_millis(250), "{wait:?} below range");
            assert!(*wait <= Duration::from_millis(750), "{wait:?} above range");
        }
        assert!(samples.iter().any(|w| *w != samples[0]));
    }

    #[test]
    fn test_config_validation() {
        assert!(Retry::builder("x").max_attempts(0).build().is_err());
        assert!(Retry::builder("x").exponential_backoff(0.5).build().is_err());
        assert!(Retry::builder("x").randomized_wait(1.5).build().is_err());
        assert!(Retry::builder("x").build().is_ok());
    }
}
