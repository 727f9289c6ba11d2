//! ResilienceMachines - Composable fault-tolerance decorators for async calls
//!
//! This crate provides the four classic protections for outbound calls:
//! - Circuit breaker driven by a count- or time-based sliding window
//!   (Closed → Open → HalfOpen, plus operator ForcedOpen / Disabled states)
//! - Retry with fixed, exponential and randomized backoff
//! - Time limiter that cancels calls exceeding a deadline
//! - Bulkhead bounding concurrent calls with a FIFO wait queue
//!
//! Protections stack in any order through [`Decorators`], and a [`Registry`]
//! shares named instances between call sites. All time flows through a
//! [`Clock`], so tests can run against a [`ManualClock`] or paused tokio time.
//!
//! # Example
//!
//! ```rust
//! use resilience_machines::{Bulkhead, CircuitBreaker, Decorators, GuardError, Retry};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let breaker = CircuitBreaker::builder("inventory")
//!     .sliding_window_size(20)
//!     .minimum_number_of_calls(10)
//!     .failure_rate_threshold(50.0)
//!     .wait_duration_in_open_state(Duration::from_secs(30))
//!     .build()?;
//! let retry = Retry::builder("inventory")
//!     .max_attempts(3)
//!     .wait_duration(Duration::from_millis(10))
//!     .build()?;
//! let bulkhead = Bulkhead::builder("inventory").max_concurrent_calls(8).build()?;
//!
//! let call = Decorators::of(|| async { Ok::<_, std::io::Error>(42) })
//!     .with_retry(&retry)
//!     .with_circuit_breaker(&breaker)
//!     .with_bulkhead(&bulkhead)
//!     .with_fallback(GuardError::is_call_not_permitted, |_| async { Ok(0) })
//!     .decorate();
//!
//! assert_eq!(call.call().await?, 42);
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod bulkhead;
pub mod callbacks;
pub mod circuit;
pub mod classifier;
pub mod clock;
pub mod decorators;
pub mod errors;
pub mod events;
pub mod registry;
pub mod retry;
pub mod time_limiter;
pub mod window;

pub use builder::CircuitBreakerBuilder;
pub use bulkhead::{
    Admission, Bulkhead, BulkheadBuilder, BulkheadConfig, BulkheadGuard, BulkheadMetrics,
};
pub use circuit::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, SlidingWindowType,
};
pub use classifier::{
    Classification, DefaultClassifier, FailureClassifier, FailureContext, PredicateClassifier,
    TypeClassifier,
};
pub use clock::{Clock, ManualClock, TokioClock};
pub use decorators::{DecoratedCall, Decorators};
pub use errors::{BulkheadFull, CallNotPermitted, ConfigError, GuardError, TimedOut};
pub use events::{
    BulkheadEventKind, CircuitBreakerEventKind, Event, RetryEventKind, TimeLimiterEventKind,
};
pub use registry::Registry;
pub use retry::{Retry, RetryBuilder, RetryConfig, RetryMetrics};
pub use time_limiter::{TimeLimiter, TimeLimiterBuilder, TimeLimiterConfig};
pub use window::{Sample, SlidingWindow, WindowCounts};

use std::fmt;
use std::time::Duration;

/// Observable state of a circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
    ForcedOpen,
    Disabled,
}

impl CircuitState {
    pub(crate) fn from_machine(state: &str) -> Self {
        match state {
            "Open" => CircuitState::Open,
            "HalfOpen" => CircuitState::HalfOpen,
            "ForcedOpen" => CircuitState::ForcedOpen,
            "Disabled" => CircuitState::Disabled,
            _ => CircuitState::Closed,
        }
    }

    /// Whether calls are admitted (HalfOpen admits a bounded quota)
    pub fn allows_calls(self) -> bool {
        !matches!(self, CircuitState::Open | CircuitState::ForcedOpen)
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
            CircuitState::ForcedOpen => "FORCED_OPEN",
            CircuitState::Disabled => "DISABLED",
        };
        f.write_str(name)
    }
}

/// Why a guard refused a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    CallNotPermitted,
    BulkheadFull,
}

/// Result of a single protected call as seen by a circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success {
        duration: Duration,
    },
    Failure {
        duration: Duration,
        classification: Classification,
    },
    Timeout {
        duration: Duration,
        classification: Classification,
    },
    Rejected {
        reason: RejectionReason,
    },
}

impl CallOutcome {
    pub fn duration(&self) -> Option<Duration> {
        match self {
            CallOutcome::Success { duration }
            | CallOutcome::Failure { duration, .. }
            | CallOutcome::Timeout { duration, .. } => Some(*duration),
            CallOutcome::Rejected { .. } => None,
        }
    }

    /// Slowness is measured independently of success or failure
    pub fn is_slow(&self, threshold: Duration) -> bool {
        self.duration().is_some_and(|d| d >= threshold)
    }

    /// Window sample for this outcome; `None` for rejections
    ///
    /// Ignored errors still carry their slowness.
    pub fn sample(&self, slow_threshold: Duration) -> Option<Sample> {
        let sample = match self {
            CallOutcome::Success { .. } => Sample::success(),
            CallOutcome::Failure { classification, .. }
            | CallOutcome::Timeout { classification, .. } => {
                if classification.counts_as_failure() {
                    Sample::failure()
                } else {
                    Sample::ignored()
                }
            }
            CallOutcome::Rejected { .. } => return None,
        };

        if self.is_slow(slow_threshold) {
            Some(sample.slow())
        } else {
            Some(sample)
        }
    }
}
