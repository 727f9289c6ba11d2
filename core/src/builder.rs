//! Builder API for ergonomic circuit breaker configuration

use crate::{
    CircuitState,
    callbacks::Callbacks,
    circuit::{CircuitBreaker, CircuitBreakerConfig, SlidingWindowType, machine::CircuitContext},
    classifier::{DefaultClassifier, FailureClassifier, FailureContext, PredicateClassifier},
    clock::{Clock, TokioClock},
    errors::ConfigError,
    events::DEFAULT_EVENT_BUFFER,
};
use std::sync::Arc;
use std::time::Duration;

/// Builder for creating circuit breakers with fluent API
pub struct CircuitBreakerBuilder {
    name: String,
    config: CircuitBreakerConfig,
    clock: Option<Arc<dyn Clock>>,
    failure_classifier: Option<Arc<dyn FailureClassifier>>,
    callbacks: Callbacks,
    event_buffer: usize,
}

impl CircuitBreakerBuilder {
    /// Create a new builder for a circuit with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: CircuitBreakerConfig::default(),
            clock: None,
            failure_classifier: None,
            callbacks: Callbacks::new(),
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: CircuitBreakerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn sliding_window_type(mut self, window_type: SlidingWindowType) -> Self {
        self.config.sliding_window_type = window_type;
        self
    }

    /// Calls (count-based) or buckets (time-based) kept in the window
    pub fn sliding_window_size(mut self, size: usize) -> Self {
        self.config.sliding_window_size = size;
        self
    }

    /// Shorthand for a time-based window of `buckets` x `bucket_duration`
    pub fn time_based_window(mut self, buckets: usize, bucket_duration: Duration) -> Self {
        self.config.sliding_window_type = SlidingWindowType::TimeBased;
        self.config.sliding_window_size = buckets;
        self.config.time_bucket_duration = bucket_duration;
        self
    }

    /// Set minimum number of calls before rates are evaluated
    pub fn minimum_number_of_calls(mut self, calls: usize) -> Self {
        self.config.minimum_number_of_calls = calls;
        self
    }

    /// Set the failure rate threshold as a percentage in (0, 100]
    /// Circuit opens when failure rate >= this value
    pub fn failure_rate_threshold(mut self, percent: f64) -> Self {
        self.config.failure_rate_threshold = percent;
        self
    }

    /// Set the slow-call rate threshold as a percentage in (0, 100]
    pub fn slow_call_rate_threshold(mut self, percent: f64) -> Self {
        self.config.slow_call_rate_threshold = Some(percent);
        self
    }

    pub fn slow_call_duration_threshold(mut self, duration: Duration) -> Self {
        self.config.slow_call_duration_threshold = duration;
        self
    }

    pub fn wait_duration_in_open_state(mut self, duration: Duration) -> Self {
        self.config.wait_duration_in_open_state = duration;
        self
    }

    /// Set the number of probe calls admitted while half-open
    pub fn permitted_number_of_calls_in_half_open_state(mut self, calls: usize) -> Self {
        self.config.permitted_number_of_calls_in_half_open_state = calls;
        self
    }

    /// Move Open -> HalfOpen on a timer (requires a tokio runtime at trip time)
    pub fn automatic_transition_from_open_to_half_open(mut self, enabled: bool) -> Self {
        self.config.automatic_transition_from_open_to_half_open_enabled = enabled;
        self
    }

    /// Set the jitter factor (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: wait * (1 - jitter + rand * jitter)
    pub fn wait_interval_jitter_factor(mut self, factor: f64) -> Self {
        self.config.wait_interval_jitter_factor = factor;
        self
    }

    /// Use a custom clock (defaults to [`TokioClock`])
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set a failure classifier to filter which errors should trip the circuit
    ///
    /// The classifier determines whether a given error should count toward
    /// opening the circuit. Use this to ignore "expected" errors like validation
    /// failures or client errors (4xx), while still tripping on server errors (5xx).
    ///
    /// # Examples
    ///
    /// ```rust
    /// use resilience_machines::{CircuitBreaker, PredicateClassifier};
    /// use std::sync::Arc;
    /// use std::time::Duration;
    ///
    /// let circuit = CircuitBreaker::builder("api")
    ///     .failure_classifier(Arc::new(PredicateClassifier::new(|ctx| {
    ///         // Only trip on slow errors
    ///         ctx.duration > Duration::from_secs(1)
    ///     })))
    ///     .build()
    ///     .unwrap();
    /// ```
    pub fn failure_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.failure_classifier = Some(classifier);
        self
    }

    /// Count an error as a failure only when `predicate` returns true
    pub fn record_if<F>(self, predicate: F) -> Self
    where
        F: Fn(&FailureContext<'_>) -> bool + Send + Sync + 'static,
    {
        self.failure_classifier(Arc::new(PredicateClassifier::new(predicate)))
    }

    /// Set callback for when circuit opens
    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_open = Some(Arc::new(f));
        self
    }

    /// Set callback for when circuit closes
    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_close = Some(Arc::new(f));
        self
    }

    /// Set callback for when circuit enters half-open
    pub fn on_half_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_half_open = Some(Arc::new(f));
        self
    }

    /// Set callback for every state transition
    pub fn on_transition<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.callbacks.on_transition = Some(Arc::new(f));
        self
    }

    /// Events buffered per subscriber before it lags
    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    /// Validate the configuration and build the circuit breaker
    pub fn build(self) -> Result<CircuitBreaker, ConfigError> {
        self.config.validate(&self.name)?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(TokioClock));
        let classifier = self
            .failure_classifier
            .unwrap_or_else(|| Arc::new(DefaultClassifier));
        let context = CircuitContext::new(self.name, self.config, clock);

        Ok(CircuitBreaker::from_parts(
            context,
            classifier,
            self.callbacks,
            self.event_buffer,
        ))
    }
}

impl std::fmt::Debug for CircuitBreakerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerBuilder")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("failure_classifier", &self.failure_classifier)
            .field("callbacks", &self.callbacks)
            .finish()
    }
}
