//! Error types for guarded calls
//!
//! Protection failures keep their own variants so a caller can tell
//! "a guard intervened" apart from "the underlying call failed".

use crate::CircuitState;
use std::time::Duration;
use thiserror::Error;

/// A circuit breaker refused to admit the call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Circuit '{circuit}' does not permit further calls (state: {state})")]
pub struct CallNotPermitted {
    pub circuit: String,
    pub state: CircuitState,
}

/// A bulkhead had no free slot within its maximum wait
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Bulkhead '{bulkhead}' is full (max concurrent calls: {max_concurrent_calls})")]
pub struct BulkheadFull {
    pub bulkhead: String,
    pub max_concurrent_calls: usize,
}

/// A time limiter abandoned the call after its deadline
///
/// Also handed to failure classifiers as the error value of a timed-out call,
/// so `ctx.error.is::<TimedOut>()` identifies timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Time limiter '{time_limiter}' timed out after {timeout:?}")]
pub struct TimedOut {
    pub time_limiter: String,
    pub timeout: Duration,
}

/// Errors produced by a guarded call
#[derive(Debug, Error)]
pub enum GuardError<E> {
    /// Circuit is open, forced open, or its half-open quota is used up
    #[error(transparent)]
    CallNotPermitted(#[from] CallNotPermitted),
    /// Bulkhead is at capacity
    #[error(transparent)]
    BulkheadFull(#[from] BulkheadFull),
    /// Call exceeded the time limiter's deadline
    #[error(transparent)]
    Timeout(#[from] TimedOut),
    /// The wrapped operation failed
    #[error("Call failed: {0}")]
    Execution(#[source] E),
}

impl<E> GuardError<E> {
    pub fn is_call_not_permitted(&self) -> bool {
        matches!(self, GuardError::CallNotPermitted(_))
    }

    pub fn is_bulkhead_full(&self) -> bool {
        matches!(self, GuardError::BulkheadFull(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, GuardError::Timeout(_))
    }

    /// True when a guard refused the call before it ran
    pub fn is_rejection(&self) -> bool {
        self.is_call_not_permitted() || self.is_bulkhead_full()
    }

    /// The caller's own error, if this is an execution failure
    pub fn execution_error(&self) -> Option<&E> {
        match self {
            GuardError::Execution(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_execution_error(self) -> Option<E> {
        match self {
            GuardError::Execution(e) => Some(e),
            _ => None,
        }
    }

    /// Map the execution error, leaving guard errors untouched
    pub fn map_execution<F, M>(self, f: M) -> GuardError<F>
    where
        M: FnOnce(E) -> F,
    {
        match self {
            GuardError::CallNotPermitted(e) => GuardError::CallNotPermitted(e),
            GuardError::BulkheadFull(e) => GuardError::BulkheadFull(e),
            GuardError::Timeout(e) => GuardError::Timeout(e),
            GuardError::Execution(e) => GuardError::Execution(f(e)),
        }
    }
}

/// Invalid configuration rejected by a builder
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid configuration for '{instance}': {message}")]
    Invalid { instance: String, message: String },
}

impl ConfigError {
    pub(crate) fn invalid(instance: &str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            instance: instance.to_string(),
            message: message.into(),
        }
    }
}
