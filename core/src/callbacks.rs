//! Synchronous hooks for circuit breaker state transitions
//!
//! Hooks run on the thread that caused the transition, after the breaker's
//! state lock is released. Keep them cheap; use the event stream for anything
//! heavier.

use crate::CircuitState;
use std::sync::Arc;

pub type StateHook = Arc<dyn Fn(&str) + Send + Sync>;
pub type TransitionHook = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_open: Option<StateHook>,
    pub on_close: Option<StateHook>,
    pub on_half_open: Option<StateHook>,
    pub on_transition: Option<TransitionHook>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatch the hooks matching a `from -> to` transition
    pub fn trigger(&self, circuit: &str, from: CircuitState, to: CircuitState) {
        if let Some(ref callback) = self.on_transition {
            callback(circuit, from, to);
        }

        let hook = match to {
            CircuitState::Open => self.on_open.as_ref(),
            CircuitState::Closed => self.on_close.as_ref(),
            CircuitState::HalfOpen => self.on_half_open.as_ref(),
            CircuitState::ForcedOpen | CircuitState::Disabled => None,
        };
        if let Some(callback) = hook {
            callback(circuit);
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_half_open", &self.on_half_open.is_some())
            .field("on_transition", &self.on_transition.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_trigger_routes_by_target_state() {
        let seen = Arc::new(Mutex::new(Vec::new()));

        let open_log = seen.clone();
        let close_log = seen.clone();
        let callbacks = Callbacks {
            on_open: Some(Arc::new(move |name| open_log.lock().push(format!("open:{name}")))),
            on_close: Some(Arc::new(move |name| close_log.lock().push(format!("close:{name}")))),
            ..Callbacks::new()
        };

        callbacks.trigger("api", CircuitState::Closed, CircuitState::Open);
        callbacks.trigger("api", CircuitState::Open, CircuitState::HalfOpen);
        callbacks.trigger("api", CircuitState::HalfOpen, CircuitState::Closed);

        assert_eq!(*seen.lock(), vec!["open:api", "close:api"]);
    }

    #[test]
    fn test_transition_hook_sees_every_change() {
        let count = Arc::new(Mutex::new(0));
        let counter = count.clone();
        let callbacks = Callbacks {
            on_transition: Some(Arc::new(move |_, _, _| *counter.lock() += 1)),
            ..Callbacks::new()
        };

        callbacks.trigger("api", CircuitState::Closed, CircuitState::ForcedOpen);
        callbacks.trigger("api", CircuitState::ForcedOpen, CircuitState::Disabled);

        assert_eq!(*count.lock(), 2);
    }
}
