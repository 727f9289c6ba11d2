//! State machine definition and transition guards

use super::CircuitBreakerConfig;
use crate::clock::{Clock, TokioClock};
use crate::window::{CountWindow, SlidingWindow, WindowCounts};
use parking_lot::Mutex;
use state_machines::state_machine;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Circuit breaker context - shared data across all states
#[derive(Clone)]
pub struct CircuitContext {
    pub name: String,
    pub config: CircuitBreakerConfig,
    pub clock: Arc<dyn Clock>,
    /// Window evaluated while Closed
    pub window: Arc<Mutex<SlidingWindow>>,
}

impl CircuitContext {
    pub fn new(name: String, config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let window = config.new_window(clock.clone());
        Self {
            name,
            config,
            clock,
            window: Arc::new(Mutex::new(window)),
        }
    }
}

impl Default for CircuitContext {
    fn default() -> Self {
        Self::new(
            String::new(),
            CircuitBreakerConfig::default(),
            Arc::new(TokioClock),
        )
    }
}

impl std::fmt::Debug for CircuitContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitContext")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("window", &"<SlidingWindow>")
            .finish()
    }
}

/// Data specific to the Open state
#[derive(Debug, Clone, Default)]
pub struct OpenData {
    pub opened_at: Option<Instant>,
    /// Wait before probing, jitter already applied
    pub wait_duration: Duration,
}

/// Data specific to the HalfOpen state
#[derive(Debug, Clone, Default)]
pub struct HalfOpenData {
    /// Probe permits still available in this half-open round
    pub permits_remaining: usize,
    /// Outcomes of the probe calls
    pub window: CountWindow,
}

impl HalfOpenData {
    pub fn new(permitted: usize) -> Self {
        Self {
            permits_remaining: permitted,
            window: CountWindow::new(permitted, permitted),
        }
    }

    pub fn quota_complete(&self) -> bool {
        self.window.counts().total >= self.window.capacity()
    }
}

/// Which threshold a window crossed
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Breach {
    FailureRate(f64),
    SlowCallRate(f64),
}

/// Evaluate the configured thresholds against a window's counts
pub fn breach(
    config: &CircuitBreakerConfig,
    counts: &WindowCounts,
    minimum_calls: usize,
) -> Option<Breach> {
    if let Some(rate) = counts.failure_rate(minimum_calls)
        && rate >= config.failure_rate_threshold
    {
        return Some(Breach::FailureRate(rate));
    }

    if let Some(threshold) = config.slow_call_rate_threshold
        && let Some(rate) = counts.slow_call_rate(minimum_calls)
        && rate >= threshold
    {
        return Some(Breach::SlowCallRate(rate));
    }

    None
}

// Define the circuit breaker state machine with dynamic mode
state_machine! {
    name: Circuit,
    context: CircuitContext,
    dynamic: true,

    initial: Closed,
    states: [
        Closed,
        Open(OpenData),
        HalfOpen(HalfOpenData),
        ForcedOpen,
        Disabled,
    ],
    events {
        trip {
            guards: [should_open],
            transition: { from: [Closed, HalfOpen], to: Open }
        }
        attempt_reset {
            guards: [wait_elapsed],
            transition: { from: Open, to: HalfOpen }
        }
        close {
            guards: [should_close],
            transition: { from: HalfOpen, to: Closed }
        }
        force_open {
            transition: { from: [Closed, Open, HalfOpen, Disabled], to: ForcedOpen }
        }
        disable {
            transition: { from: [Closed, Open, HalfOpen, ForcedOpen], to: Disabled }
        }
    }
}

// Guards for dynamic mode - implemented on typestate machines
impl Circuit<Closed> {
    /// Rate thresholds crossed with enough calls recorded
    fn should_open(&self, ctx: &CircuitContext) -> bool {
        let mut window = ctx.window.lock();
        let minimum = window.minimum_calls();
        breach(&ctx.config, &window.snapshot(), minimum).is_some()
    }
}

impl Circuit<HalfOpen> {
    /// Probe quota complete and a threshold still crossed
    fn should_open(&self, ctx: &CircuitContext) -> bool {
        self.state_data_half_open().is_some_and(|data| {
            data.quota_complete()
                && breach(
                    &ctx.config,
                    &data.window.counts(),
                    data.window.minimum_calls(),
                )
                .is_some()
        })
    }

    /// Probe quota complete with every rate below its threshold
    fn should_close(&self, ctx: &CircuitContext) -> bool {
        self.state_data_half_open().is_some_and(|data| {
            data.quota_complete()
                && breach(
                    &ctx.config,
                    &data.window.counts(),
                    data.window.minimum_calls(),
                )
                .is_none()
        })
    }
}

impl Circuit<Open> {
    /// Check if the wait has elapsed for Open -> HalfOpen transition
    fn wait_elapsed(&self, ctx: &CircuitContext) -> bool {
        let Some(data) = self.state_data_open() else {
            return true;
        };
        match data.opened_at {
            Some(opened_at) => {
                ctx.clock.now().saturating_duration_since(opened_at) >= data.wait_duration
            }
            None => true,
        }
    }
}
