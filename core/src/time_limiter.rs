//! Time limiter bounding how long a call may run
//!
//! On timeout the caller gets [`TimedOut`] right away. With
//! `cancel_running_future` the call's future is dropped, releasing whatever
//! it holds (bulkhead slots, breaker permits); otherwise it keeps running
//! detached on the runtime and its result is discarded.

use crate::clock::{Clock, TokioClock};
use crate::errors::{ConfigError, GuardError, TimedOut};
use crate::events::{DEFAULT_EVENT_BUFFER, Event, EventPublisher, TimeLimiterEventKind};
use futures::TryFutureExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Time limiter configuration
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct TimeLimiterConfig {
    pub timeout_duration: Duration,
    /// Drop the call's future on timeout instead of detaching it
    pub cancel_running_future: bool,
}

impl Default for TimeLimiterConfig {
    fn default() -> Self {
        Self {
            timeout_duration: Duration::from_secs(1),
            cancel_running_future: true,
        }
    }
}

impl TimeLimiterConfig {
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.timeout_duration.is_zero() {
            return Err(ConfigError::invalid(name, "timeout_duration must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct TimeLimiterInner {
    name: String,
    config: TimeLimiterConfig,
    clock: Arc<dyn Clock>,
    events: EventPublisher<TimeLimiterEventKind>,
}

#[derive(Debug, Clone)]
pub struct TimeLimiter {
    inner: Arc<TimeLimiterInner>,
}

impl TimeLimiter {
    pub fn new(name: impl Into<String>, config: TimeLimiterConfig) -> Result<Self, ConfigError> {
        Self::builder(name).config(config).build()
    }

    pub fn builder(name: impl Into<String>) -> TimeLimiterBuilder {
        TimeLimiterBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &TimeLimiterConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event<TimeLimiterEventKind>> {
        self.inner.events.subscribe()
    }

    fn timed_out(&self) -> TimedOut {
        let timeout = self.inner.config.timeout_duration;
        warn!(time_limiter = %self.inner.name, ?timeout, "Call timed out");
        TimedOut {
            time_limiter: self.inner.name.clone(),
            timeout,
        }
    }

    /// Run `operation` under the configured deadline
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, GuardError<E>>
    where
        T: Send + 'static,
        E: Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, GuardError<E>>> + Send + 'static,
    {
        let deadline = self.inner.clock.sleep(self.inner.config.timeout_duration);

        let completed = if self.inner.config.cancel_running_future {
            tokio::select! {
                biased;
                result = operation() => Some(result),
                _ = deadline => None,
            }
        } else {
            let mut task = tokio::spawn(operation());
            tokio::select! {
                biased;
                joined = &mut task => match joined {
                    Ok(result) => Some(result),
                    Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                    Err(_) => None,
                },
                _ = deadline => {
                    debug!(time_limiter = %self.inner.name, "Detaching timed out call");
                    None
                }
            }
        };

        let now = self.inner.clock.now();
        match completed {
            Some(Ok(value)) => {
                self.inner.events.publish(now, TimeLimiterEventKind::Success);
                Ok(value)
            }
            Some(Err(error)) => {
                self.inner.events.publish(now, TimeLimiterEventKind::Error);
                Err(error)
            }
            None => {
                self.inner.events.publish(now, TimeLimiterEventKind::Timeout);
                Err(GuardError::Timeout(self.timed_out()))
            }
        }
    }

    /// Run a plain fallible operation under the configured deadline
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, GuardError<E>>
    where
        T: Send + 'static,
        E: Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.execute(|| operation().map_err(GuardError::Execution))
            .await
    }
}

/// Builder for [`TimeLimiter`]
pub struct TimeLimiterBuilder {
    name: String,
    config: TimeLimiterConfig,
    clock: Option<Arc<dyn Clock>>,
    event_buffer: usize,
}

impl TimeLimiterBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: TimeLimiterConfig::default(),
            clock: None,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    pub fn config(mut self, config: TimeLimiterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn timeout_duration(mut self, timeout: Duration) -> Self {
        self.config.timeout_duration = timeout;
        self
    }

    pub fn cancel_running_future(mut self, cancel: bool) -> Self {
        self.config.cancel_running_future = cancel;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    pub fn build(self) -> Result<TimeLimiter, ConfigError> {
        self.config.validate(&self.name)?;
        Ok(TimeLimiter {
            inner: Arc::new(TimeLimiterInner {
                events: EventPublisher::new(&self.name, self.event_buffer),
                name: self.name,
                config: self.config,
                clock: self.clock.unwrap_or_else(|| Arc::new(TokioClock)),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug)]
    struct Boom;

    fn limiter(timeout: Duration, cancel: bool) -> TimeLimiter {
        TimeLimiter::builder("test")
            .timeout_duration(timeout)
            .cancel_running_future(cancel)
            .build()
            .expect("valid config")
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_within_deadline_succeeds() {
        let limiter = limiter(Duration::from_secs(3), true);

        let result: Result<&str, GuardError<Boom>> = limiter
            .call(|| async {
                tokio::time::sleep(Duration::from_millis(2900)).await;
                Ok("done")
            })
            .await;

        assert_eq!(result.unwrap(), "done");
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_past_deadline_times_out() {
        let limiter = limiter(Duration::from_secs(3), true);
        let mut events = limiter.subscribe();

        let started = tokio::time::Instant::now();
        let result: Result<&str, GuardError<Boom>> = limiter
            .call(|| async {
                tokio::time::sleep(Duration::from_millis(3100)).await;
                Ok("late")
            })
            .await;

        let err = result.unwrap_err();
        assert!(err.is_timeout());
        assert!(matches!(
            err,
            GuardError::Timeout(TimedOut { ref time_limiter, timeout })
                if time_limiter == "test" && timeout == Duration::from_secs(3)
        ));
        assert!(started.elapsed() < Duration::from_millis(3100));
        assert_eq!(
            events.try_recv().unwrap().kind,
            TimeLimiterEventKind::Timeout
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_future_never_completes() {
        let limiter = limiter(Duration::from_secs(1), true);
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();

        let result: Result<(), GuardError<Boom>> = limiter
            .call(|| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(result.unwrap_err().is_timeout());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_detached_future_keeps_running() {
        let limiter = limiter(Duration::from_secs(1), false);
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();

        let result: Result<(), GuardError<Boom>> = limiter
            .call(|| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(result.unwrap_err().is_timeout());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_errors_pass_through() {
        let limiter = limiter(Duration::from_secs(1), false);

        let result: Result<(), GuardError<Boom>> = limiter.call(|| async { Err(Boom) }).await;

        assert!(matches!(result, Err(GuardError::Execution(Boom))));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        assert!(
            TimeLimiter::builder("test")
                .timeout_duration(Duration::ZERO)
                .build()
                .is_err()
        );
    }
}
