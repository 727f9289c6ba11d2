//! Circuit breaker implementation using state machines
//!
//! The breaker admits calls while Closed, rejects them while Open and lets a
//! bounded number of probe calls through while HalfOpen. Rates come from a
//! [`SlidingWindow`]; transitions are driven by the `Circuit` state machine in
//! [`machine`], whose guards evaluate the thresholds.

pub mod machine;

use crate::callbacks::Callbacks;
use crate::classifier::{Classification, FailureClassifier, FailureContext};
use crate::clock::Clock;
use crate::errors::{CallNotPermitted, ConfigError, GuardError, TimedOut};
use crate::events::{CircuitBreakerEventKind, Event, EventPublisher};
use crate::window::SlidingWindow;
use crate::{CallOutcome, CircuitState, RejectionReason};
use futures::TryFutureExt;
use machine::{Breach, CircuitContext, CircuitEvent, DynamicCircuit, HalfOpenData};
use parking_lot::Mutex;
use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// How the sliding window aggregates calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SlidingWindowType {
    /// Last `sliding_window_size` calls
    #[default]
    CountBased,
    /// Calls of the last `sliding_window_size` time buckets
    TimeBased,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct CircuitBreakerConfig {
    pub sliding_window_type: SlidingWindowType,

    /// Number of calls (count-based) or buckets (time-based)
    pub sliding_window_size: usize,

    /// Width of one bucket of a time-based window
    pub time_bucket_duration: Duration,

    /// Calls required before rates are evaluated.
    /// Clamped to `sliding_window_size` for count-based windows.
    pub minimum_number_of_calls: usize,

    /// Failure percentage (0, 100] at or above which the circuit opens
    pub failure_rate_threshold: f64,

    /// Slow-call percentage (0, 100] at or above which the circuit opens.
    /// `None` disables slow-call tripping.
    pub slow_call_rate_threshold: Option<f64>,

    /// Calls lasting at least this long count as slow
    pub slow_call_duration_threshold: Duration,

    /// Time spent Open before probing
    pub wait_duration_in_open_state: Duration,

    /// Probe calls admitted while HalfOpen
    pub permitted_number_of_calls_in_half_open_state: usize,

    /// Move Open -> HalfOpen on a timer instead of on the next call
    pub automatic_transition_from_open_to_half_open_enabled: bool,

    /// Jitter factor for the open wait (0.0 = no jitter, 1.0 = full jitter).
    /// Uses chrono-machines formula: wait * (1 - jitter + rand * jitter)
    pub wait_interval_jitter_factor: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            sliding_window_type: SlidingWindowType::CountBased,
            sliding_window_size: 100,
            time_bucket_duration: Duration::from_secs(1),
            minimum_number_of_calls: 100,
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: None,
            slow_call_duration_threshold: Duration::from_secs(60),
            wait_duration_in_open_state: Duration::from_secs(60),
            permitted_number_of_calls_in_half_open_state: 10,
            automatic_transition_from_open_to_half_open_enabled: false,
            wait_interval_jitter_factor: 0.0,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.sliding_window_size == 0 {
            return Err(ConfigError::invalid(name, "sliding_window_size must be > 0"));
        }
        if self.minimum_number_of_calls == 0 {
            return Err(ConfigError::invalid(
                name,
                "minimum_number_of_calls must be > 0",
            ));
        }
        if self.sliding_window_type == SlidingWindowType::TimeBased
            && self.time_bucket_duration.is_zero()
        {
            return Err(ConfigError::invalid(
                name,
                "time_bucket_duration must be > 0",
            ));
        }
        if !(self.failure_rate_threshold > 0.0 && self.failure_rate_threshold <= 100.0) {
            return Err(ConfigError::invalid(
                name,
                format!(
                    "failure_rate_threshold must be in (0, 100], got {}",
                    self.failure_rate_threshold
                ),
            ));
        }
        if let Some(threshold) = self.slow_call_rate_threshold
            && !(threshold > 0.0 && threshold <= 100.0)
        {
            return Err(ConfigError::invalid(
                name,
                format!("slow_call_rate_threshold must be in (0, 100], got {threshold}"),
            ));
        }
        if self.permitted_number_of_calls_in_half_open_state == 0 {
            return Err(ConfigError::invalid(
                name,
                "permitted_number_of_calls_in_half_open_state must be > 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.wait_interval_jitter_factor) {
            return Err(ConfigError::invalid(
                name,
                "wait_interval_jitter_factor must be in [0, 1]",
            ));
        }
        Ok(())
    }

    pub(crate) fn new_window(&self, clock: Arc<dyn Clock>) -> SlidingWindow {
        match self.sliding_window_type {
            SlidingWindowType::CountBased => {
                SlidingWindow::count_based(self.sliding_window_size, self.minimum_number_of_calls)
            }
            SlidingWindowType::TimeBased => SlidingWindow::time_based(
                self.time_bucket_duration,
                self.sliding_window_size,
                self.minimum_number_of_calls,
                clock,
            ),
        }
    }

    /// Open wait for one opening, jitter applied
    fn open_wait(&self) -> Duration {
        if self.wait_interval_jitter_factor <= 0.0 {
            return self.wait_duration_in_open_state;
        }
        let base_ms = u64::try_from(self.wait_duration_in_open_state.as_millis()).unwrap_or(u64::MAX);
        let policy = chrono_machines::Policy {
            max_attempts: 1,
            base_delay_ms: base_ms,
            multiplier: 1.0,
            max_delay_ms: base_ms,
        };
        let wait_ms = policy.calculate_delay(1, self.wait_interval_jitter_factor);
        Duration::from_millis(wait_ms)
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    /// `None` until the active window holds the minimum number of calls
    pub failure_rate: Option<f64>,
    pub slow_call_rate: Option<f64>,
    pub buffered_calls: usize,
    pub failed_calls: usize,
    pub slow_calls: usize,
    pub not_permitted_calls: u64,
}

/// Side effects collected under the state lock and dispatched after it
#[derive(Default)]
struct Effects {
    events: Vec<CircuitBreakerEventKind>,
    reopen_after: Option<Duration>,
}

struct BreakerInner {
    context: CircuitContext,
    machine: Mutex<DynamicCircuit>,
    classifier: Arc<dyn FailureClassifier>,
    callbacks: Callbacks,
    events: EventPublisher<CircuitBreakerEventKind>,
    not_permitted: AtomicU64,
    /// Bumped under the state lock on every transition
    generation: AtomicU64,
}

/// Circuit breaker public API
///
/// Cloning is cheap and clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a circuit breaker on the tokio clock (use builder() for more options)
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Result<Self, ConfigError> {
        Self::builder(name).config(config).build()
    }

    /// Create a new circuit breaker builder
    pub fn builder(name: impl Into<String>) -> crate::builder::CircuitBreakerBuilder {
        crate::builder::CircuitBreakerBuilder::new(name)
    }

    pub(crate) fn from_parts(
        context: CircuitContext,
        classifier: Arc<dyn FailureClassifier>,
        callbacks: Callbacks,
        event_buffer: usize,
    ) -> Self {
        let events = EventPublisher::new(&context.name, event_buffer);
        let machine = Mutex::new(DynamicCircuit::new(context.clone()));
        Self {
            inner: Arc::new(BreakerInner {
                context,
                machine,
                classifier,
                callbacks,
                events,
                not_permitted: AtomicU64::new(0),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.context.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.inner.context.config
    }

    /// Current state. Does not perform the lazy Open -> HalfOpen transition.
    pub fn state(&self) -> CircuitState {
        CircuitState::from_machine(self.inner.machine.lock().current_state())
    }

    pub fn is_open(&self) -> bool {
        !self.state().allows_calls()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    /// Subscribe to this breaker's event stream
    pub fn subscribe(&self) -> broadcast::Receiver<Event<CircuitBreakerEventKind>> {
        self.inner.events.subscribe()
    }

    fn now(&self) -> Instant {
        self.inner.context.clock.now()
    }

    // Only read or bumped while the state lock is held
    fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Relaxed)
    }

    fn next_generation(&self) {
        self.inner.generation.fetch_add(1, Ordering::Relaxed);
    }

    /// Ask for permission to run one call
    ///
    /// An Open circuit whose wait has elapsed moves to HalfOpen here. Every
    /// granted permit must be completed through [`CallPermit`]; dropping it
    /// unfinished hands a half-open slot back.
    pub fn try_acquire_permission(&self) -> Result<CallPermit, CallNotPermitted> {
        let mut effects = Effects::default();
        let decision = {
            let mut machine = self.inner.machine.lock();
            let mut state = CircuitState::from_machine(machine.current_state());
            if state == CircuitState::Open && self.try_half_open(&mut machine, &mut effects) {
                state = CircuitState::HalfOpen;
            }

            let generation = self.generation();
            match state {
                CircuitState::Closed | CircuitState::Disabled => Ok((state, generation)),
                CircuitState::HalfOpen => match machine.half_open_data_mut() {
                    Some(data) if data.permits_remaining > 0 => {
                        data.permits_remaining -= 1;
                        Ok((state, generation))
                    }
                    _ => Err(state),
                },
                CircuitState::Open | CircuitState::ForcedOpen => Err(state),
            }
        };

        let result = match decision {
            Ok((state, generation)) => Ok(CallPermit {
                breaker: self.clone(),
                acquired_in: state,
                generation,
                started_at: self.now(),
                completed: false,
            }),
            Err(state) => {
                self.inner.not_permitted.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name(), %state, "Circuit breaker rejecting call");
                effects
                    .events
                    .push(CircuitBreakerEventKind::NotPermitted { state });
                Err(CallNotPermitted {
                    circuit: self.name().to_string(),
                    state,
                })
            }
        };

        self.dispatch(effects);
        result
    }

    /// Execute an operation whose errors are already [`GuardError`]s
    ///
    /// Inner guard rejections pass through without being recorded; timeouts
    /// and execution errors go through the failure classifier.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, GuardError<E>>
    where
        E: Any,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, GuardError<E>>>,
    {
        let permit = self.try_acquire_permission()?;
        let result = operation().await;
        let elapsed = permit.elapsed();

        match &result {
            Ok(_) => permit.on_success(elapsed),
            Err(GuardError::Execution(error)) => permit.on_error(elapsed, error as &dyn Any),
            Err(GuardError::Timeout(timeout)) => permit.on_timeout(elapsed, timeout),
            Err(GuardError::CallNotPermitted(_)) => {
                permit.record(CallOutcome::Rejected {
                    reason: RejectionReason::CallNotPermitted,
                });
            }
            Err(GuardError::BulkheadFull(_)) => {
                permit.record(CallOutcome::Rejected {
                    reason: RejectionReason::BulkheadFull,
                });
            }
        }
        result
    }

    /// Execute a plain fallible operation with circuit breaker protection
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, GuardError<E>>
    where
        E: Any,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute(|| operation().map_err(GuardError::Execution))
            .await
    }

    /// Classify an error through this breaker's classifier
    pub fn classify(&self, error: &dyn Any, duration: Duration) -> Classification {
        self.inner.classifier.classify(&FailureContext {
            instance: self.name(),
            error,
            duration,
        })
    }

    fn complete(&self, acquired_in: CircuitState, generation: u64, outcome: CallOutcome) {
        if acquired_in == CircuitState::Disabled {
            return;
        }

        let config = &self.inner.context.config;
        let (Some(sample), Some(duration)) = (
            outcome.sample(config.slow_call_duration_threshold),
            outcome.duration(),
        ) else {
            self.release(acquired_in, generation);
            return;
        };

        let mut effects = Effects::default();
        effects.events.push(if sample.ignored {
            debug!(circuit = %self.name(), ?duration, "Circuit breaker ignoring error");
            CircuitBreakerEventKind::IgnoredError { duration }
        } else if sample.failed {
            CircuitBreakerEventKind::Error { duration }
        } else {
            CircuitBreakerEventKind::Success { duration }
        });

        {
            let mut machine = self.inner.machine.lock();
            // Late results of calls admitted before a transition are dropped
            if self.generation() == generation {
                match CircuitState::from_machine(machine.current_state()) {
                    CircuitState::Closed => {
                        self.inner.context.window.lock().record(sample);
                        self.try_trip(&mut machine, CircuitState::Closed, &mut effects);
                    }
                    CircuitState::HalfOpen => {
                        let permitted = config.permitted_number_of_calls_in_half_open_state;
                        if let Some(data) = machine.half_open_data_mut() {
                            data.window.record(sample);
                            if sample.ignored {
                                data.permits_remaining = (data.permits_remaining + 1).min(permitted);
                            }
                        }
                        if !self.try_trip(&mut machine, CircuitState::HalfOpen, &mut effects)
                            && machine.handle(CircuitEvent::Close).is_ok()
                        {
                            self.next_generation();
                            self.inner.context.window.lock().reset();
                            effects.events.push(CircuitBreakerEventKind::StateTransition {
                                from: CircuitState::HalfOpen,
                                to: CircuitState::Closed,
                            });
                        }
                    }
                    _ => {}
                }
            }
        }

        self.dispatch(effects);
    }

    /// Give back a half-open probe slot that produced no sample
    fn release(&self, acquired_in: CircuitState, generation: u64) {
        if acquired_in != CircuitState::HalfOpen {
            return;
        }
        let permitted = self.config().permitted_number_of_calls_in_half_open_state;
        let mut machine = self.inner.machine.lock();
        if self.generation() != generation {
            return;
        }
        if let Some(data) = machine.half_open_data_mut() {
            data.permits_remaining = (data.permits_remaining + 1).min(permitted);
        }
    }

    fn try_trip(
        &self,
        machine: &mut DynamicCircuit,
        from: CircuitState,
        effects: &mut Effects,
    ) -> bool {
        let config = &self.inner.context.config;
        let breach = match from {
            CircuitState::HalfOpen => machine.half_open_data().and_then(|data| {
                if !data.quota_complete() {
                    return None;
                }
                machine::breach(config, &data.window.counts(), data.window.minimum_calls())
            }),
            _ => {
                let mut window = self.inner.context.window.lock();
                let minimum = window.minimum_calls();
                machine::breach(config, &window.snapshot(), minimum)
            }
        };
        let Some(breach) = breach else {
            return false;
        };

        if machine.handle(CircuitEvent::Trip).is_err() {
            return false;
        }
        self.next_generation();

        let wait = config.open_wait();
        let opened_at = self.now();
        if let Some(data) = machine.open_data_mut() {
            data.opened_at = Some(opened_at);
            data.wait_duration = wait;
        }
        self.inner.context.window.lock().reset();

        match breach {
            Breach::FailureRate(failure_rate) => {
                warn!(circuit = %self.name(), failure_rate, "Circuit breaker failure rate exceeded");
                effects
                    .events
                    .push(CircuitBreakerEventKind::FailureRateExceeded { failure_rate });
            }
            Breach::SlowCallRate(slow_call_rate) => {
                warn!(circuit = %self.name(), slow_call_rate, "Circuit breaker slow call rate exceeded");
                effects
                    .events
                    .push(CircuitBreakerEventKind::SlowCallRateExceeded { slow_call_rate });
            }
        }
        effects.events.push(CircuitBreakerEventKind::StateTransition {
            from,
            to: CircuitState::Open,
        });
        if config.automatic_transition_from_open_to_half_open_enabled {
            effects.reopen_after = Some(wait);
        }
        true
    }

    fn try_half_open(&self, machine: &mut DynamicCircuit, effects: &mut Effects) -> bool {
        if machine.handle(CircuitEvent::AttemptReset).is_err() {
            return false;
        }
        self.next_generation();
        let permitted = self.config().permitted_number_of_calls_in_half_open_state;
        if let Some(data) = machine.half_open_data_mut() {
            *data = HalfOpenData::new(permitted);
        }
        effects.events.push(CircuitBreakerEventKind::StateTransition {
            from: CircuitState::Open,
            to: CircuitState::HalfOpen,
        });
        true
    }

    /// Timer-driven Open -> HalfOpen; no-op if the state moved on meanwhile
    fn attempt_half_open(&self) {
        let mut effects = Effects::default();
        {
            let mut machine = self.inner.machine.lock();
            if CircuitState::from_machine(machine.current_state()) == CircuitState::Open {
                self.try_half_open(&mut machine, &mut effects);
            }
        }
        self.dispatch(effects);
    }

    fn schedule_half_open(&self, wait: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(circuit = %self.name(), "No runtime for automatic half-open, falling back to lazy transition");
            return;
        };
        let breaker: Weak<BreakerInner> = Arc::downgrade(&self.inner);
        let sleep = self.inner.context.clock.sleep(wait);
        runtime.spawn(async move {
            sleep.await;
            if let Some(inner) = breaker.upgrade() {
                CircuitBreaker { inner }.attempt_half_open();
            }
        });
    }

    fn dispatch(&self, effects: Effects) {
        let now = self.now();
        for kind in effects.events {
            if let CircuitBreakerEventKind::StateTransition { from, to } = kind {
                match to {
                    CircuitState::Open | CircuitState::ForcedOpen => {
                        warn!(circuit = %self.name(), %from, %to, "Circuit breaker state transition")
                    }
                    _ => info!(circuit = %self.name(), %from, %to, "Circuit breaker state transition"),
                }
                self.inner.callbacks.trigger(self.name(), from, to);
            }
            self.inner.events.publish(now, kind);
        }
        if let Some(wait) = effects.reopen_after {
            self.schedule_half_open(wait);
        }
    }

    fn operator_transition(&self, event: CircuitEvent) {
        let mut effects = Effects::default();
        {
            let mut machine = self.inner.machine.lock();
            let from = CircuitState::from_machine(machine.current_state());
            if machine.handle(event).is_ok() {
                self.next_generation();
                let to = CircuitState::from_machine(machine.current_state());
                self.inner.context.window.lock().reset();
                effects
                    .events
                    .push(CircuitBreakerEventKind::StateTransition { from, to });
            }
        }
        self.dispatch(effects);
    }

    /// Reject every call until another operator transition
    pub fn transition_to_forced_open(&self) {
        self.operator_transition(CircuitEvent::ForceOpen);
    }

    /// Admit every call without recording anything
    pub fn transition_to_disabled(&self) {
        self.operator_transition(CircuitEvent::Disable);
    }

    /// Move to Closed from any state with an empty window
    pub fn transition_to_closed(&self) {
        let mut effects = Effects::default();
        {
            let mut machine = self.inner.machine.lock();
            let from = CircuitState::from_machine(machine.current_state());
            *machine = DynamicCircuit::new(self.inner.context.clone());
            self.next_generation();
            self.inner.context.window.lock().reset();
            if from != CircuitState::Closed {
                effects.events.push(CircuitBreakerEventKind::StateTransition {
                    from,
                    to: CircuitState::Closed,
                });
            }
        }
        self.dispatch(effects);
    }

    /// Return to a pristine Closed breaker, clearing counters as well
    pub fn reset(&self) {
        self.transition_to_closed();
        self.inner.not_permitted.store(0, Ordering::Relaxed);
        info!(circuit = %self.name(), "Circuit breaker manually reset to closed state");
        self.inner
            .events
            .publish(self.now(), CircuitBreakerEventKind::Reset);
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let machine = self.inner.machine.lock();
        let state = CircuitState::from_machine(machine.current_state());
        let (counts, minimum) = match machine.half_open_data() {
            Some(data) if state == CircuitState::HalfOpen => {
                (data.window.counts(), data.window.minimum_calls())
            }
            _ => {
                let mut window = self.inner.context.window.lock();
                let minimum = window.minimum_calls();
                (window.snapshot(), minimum)
            }
        };

        CircuitBreakerMetrics {
            state,
            failure_rate: counts.failure_rate(minimum),
            slow_call_rate: counts.slow_call_rate(minimum),
            buffered_calls: counts.total,
            failed_calls: counts.failed,
            slow_calls: counts.slow,
            not_permitted_calls: self.inner.not_permitted.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("classifier", &self.inner.classifier)
            .field("callbacks", &self.inner.callbacks)
            .finish()
    }
}

/// Permission to run one call through a breaker
///
/// Consumed by reporting the call's outcome. Dropping an unfinished permit
/// records nothing and frees its half-open slot.
#[must_use = "a permit must be completed with on_success / on_error"]
pub struct CallPermit {
    breaker: CircuitBreaker,
    acquired_in: CircuitState,
    generation: u64,
    started_at: Instant,
    completed: bool,
}

impl CallPermit {
    /// State the breaker was in when the permit was granted
    pub fn state(&self) -> CircuitState {
        self.acquired_in
    }

    /// Time since the permit was granted, on the breaker's clock
    pub fn elapsed(&self) -> Duration {
        self.breaker.now().saturating_duration_since(self.started_at)
    }

    pub fn on_success(self, duration: Duration) {
        self.record(CallOutcome::Success { duration });
    }

    /// Report a failed call; the breaker's classifier decides whether it counts
    pub fn on_error(self, duration: Duration, error: &dyn Any) {
        let classification = self.breaker.classify(error, duration);
        self.record(CallOutcome::Failure {
            duration,
            classification,
        });
    }

    pub fn on_timeout(self, duration: Duration, timeout: &TimedOut) {
        let classification = self.breaker.classify(timeout, duration);
        self.record(CallOutcome::Timeout {
            duration,
            classification,
        });
    }

    pub fn record(mut self, outcome: CallOutcome) {
        self.completed = true;
        self.breaker.complete(self.acquired_in, self.generation, outcome);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.completed {
            self.breaker.release(self.acquired_in, self.generation);
        }
    }
}

impl std::fmt::Debug for CallPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallPermit")
            .field("circuit", &self.breaker.name())
            .field("acquired_in", &self.acquired_in)
            .field("generation", &self.generation)
            .field("completed", &self.completed)
            .finish()
    }
}
