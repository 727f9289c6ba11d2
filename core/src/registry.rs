//! Named instance registry
//!
//! Call sites that use the same name share one breaker / retry / limiter /
//! bulkhead. Instances are created on first lookup from the registry's
//! default configuration, or from an explicit one.

use crate::bulkhead::{Bulkhead, BulkheadConfig};
use crate::circuit::{CircuitBreaker, CircuitBreakerConfig};
use crate::clock::{Clock, TokioClock};
use crate::errors::ConfigError;
use crate::retry::{Retry, RetryConfig};
use crate::time_limiter::{TimeLimiter, TimeLimiterConfig};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

type Instances<T> = RwLock<HashMap<String, T>>;

fn get_or_try_insert<T: Clone>(
    instances: &Instances<T>,
    name: &str,
    create: impl FnOnce() -> Result<T, ConfigError>,
) -> Result<T, ConfigError> {
    if let Some(existing) = instances.read().get(name) {
        return Ok(existing.clone());
    }

    let mut instances = instances.write();
    if let Some(existing) = instances.get(name) {
        return Ok(existing.clone());
    }
    let created = create()?;
    instances.insert(name.to_string(), created.clone());
    Ok(created)
}

fn sorted_names<T>(instances: &Instances<T>) -> Vec<String> {
    let mut names: Vec<_> = instances.read().keys().cloned().collect();
    names.sort();
    names
}

/// Registry of named protection instances sharing one clock
pub struct Registry {
    clock: Arc<dyn Clock>,
    circuit_breaker_defaults: CircuitBreakerConfig,
    retry_defaults: RetryConfig,
    time_limiter_defaults: TimeLimiterConfig,
    bulkhead_defaults: BulkheadConfig,
    circuit_breakers: Instances<CircuitBreaker>,
    retries: Instances<Retry>,
    time_limiters: Instances<TimeLimiter>,
    bulkheads: Instances<Bulkhead>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(TokioClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            circuit_breaker_defaults: CircuitBreakerConfig::default(),
            retry_defaults: RetryConfig::default(),
            time_limiter_defaults: TimeLimiterConfig::default(),
            bulkhead_defaults: BulkheadConfig::default(),
            circuit_breakers: RwLock::new(HashMap::new()),
            retries: RwLock::new(HashMap::new()),
            time_limiters: RwLock::new(HashMap::new()),
            bulkheads: RwLock::new(HashMap::new()),
        }
    }

    pub fn circuit_breaker_defaults(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker_defaults = config;
        self
    }

    pub fn retry_defaults(mut self, config: RetryConfig) -> Self {
        self.retry_defaults = config;
        self
    }

    pub fn time_limiter_defaults(mut self, config: TimeLimiterConfig) -> Self {
        self.time_limiter_defaults = config;
        self
    }

    pub fn bulkhead_defaults(mut self, config: BulkheadConfig) -> Self {
        self.bulkhead_defaults = config;
        self
    }

    pub fn circuit_breaker(&self, name: &str) -> Result<CircuitBreaker, ConfigError> {
        self.circuit_breaker_with(name, self.circuit_breaker_defaults.clone())
    }

    /// Existing breaker named `name`, or a new one built from `config`
    pub fn circuit_breaker_with(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> Result<CircuitBreaker, ConfigError> {
        get_or_try_insert(&self.circuit_breakers, name, || {
            debug!(circuit = name, "Registering circuit breaker");
            CircuitBreaker::builder(name)
                .config(config)
                .clock(self.clock.clone())
                .build()
        })
    }

    /// Register a pre-built breaker, replacing any with the same name
    pub fn register_circuit_breaker(&self, breaker: CircuitBreaker) -> Option<CircuitBreaker> {
        self.circuit_breakers
            .write()
            .insert(breaker.name().to_string(), breaker)
    }

    pub fn remove_circuit_breaker(&self, name: &str) -> Option<CircuitBreaker> {
        self.circuit_breakers.write().remove(name)
    }

    pub fn circuit_breaker_names(&self) -> Vec<String> {
        sorted_names(&self.circuit_breakers)
    }

    pub fn retry(&self, name: &str) -> Result<Retry, ConfigError> {
        self.retry_with(name, self.retry_defaults.clone())
    }

    pub fn retry_with(&self, name: &str, config: RetryConfig) -> Result<Retry, ConfigError> {
        get_or_try_insert(&self.retries, name, || {
            debug!(retry = name, "Registering retry");
            Retry::builder(name)
                .config(config)
                .clock(self.clock.clone())
                .build()
        })
    }

    pub fn register_retry(&self, retry: Retry) -> Option<Retry> {
        self.retries.write().insert(retry.name().to_string(), retry)
    }

    pub fn retry_names(&self) -> Vec<String> {
        sorted_names(&self.retries)
    }

    pub fn time_limiter(&self, name: &str) -> Result<TimeLimiter, ConfigError> {
        self.time_limiter_with(name, self.time_limiter_defaults.clone())
    }

    pub fn time_limiter_with(
        &self,
        name: &str,
        config: TimeLimiterConfig,
    ) -> Result<TimeLimiter, ConfigError> {
        get_or_try_insert(&self.time_limiters, name, || {
            debug!(time_limiter = name, "Registering time limiter");
            TimeLimiter::builder(name)
                .config(config)
                .clock(self.clock.clone())
                .build()
        })
    }

    pub fn time_limiter_names(&self) -> Vec<String> {
        sorted_names(&self.time_limiters)
    }

    pub fn bulkhead(&self, name: &str) -> Result<Bulkhead, ConfigError> {
        self.bulkhead_with(name, self.bulkhead_defaults.clone())
    }

    pub fn bulkhead_with(&self, name: &str, config: BulkheadConfig) -> Result<Bulkhead, ConfigError> {
        get_or_try_insert(&self.bulkheads, name, || {
            debug!(bulkhead = name, "Registering bulkhead");
            Bulkhead::builder(name)
                .config(config)
                .clock(self.clock.clone())
                .build()
        })
    }

    pub fn bulkhead_names(&self) -> Vec<String> {
        sorted_names(&self.bulkheads)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("clock", &self.clock)
            .field("circuit_breakers", &self.circuit_breaker_names())
            .field("retries", &self.retry_names())
            .field("time_limiters", &self.time_limiter_names())
            .field("bulkheads", &self.bulkhead_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CircuitState;
    use crate::clock::ManualClock;
    use std::time::Duration;

    #[test]
    fn test_same_name_shares_instance() {
        let registry = Registry::with_clock(Arc::new(ManualClock::new()));

        let a = registry.circuit_breaker("payments").unwrap();
        let b = registry.circuit_breaker("payments").unwrap();
        a.transition_to_forced_open();

        assert_eq!(b.state(), CircuitState::ForcedOpen);
        assert_eq!(registry.circuit_breaker_names(), vec!["payments"]);
    }

    #[test]
    fn test_explicit_config_applies_on_first_lookup_only() {
        let registry = Registry::new();
        let config = BulkheadConfig {
            max_concurrent_calls: 2,
            max_wait_duration: Duration::ZERO,
        };

        let first = registry.bulkhead_with("db", config).unwrap();
        let second = registry.bulkhead("db").unwrap();

        assert_eq!(first.limit(), 2);
        assert_eq!(second.limit(), 2);
    }

    #[test]
    fn test_defaults_are_used_for_new_instances() {
        let registry = Registry::new().retry_defaults(RetryConfig {
            max_attempts: 7,
            ..Default::default()
        });

        assert_eq!(registry.retry("search").unwrap().config().max_attempts, 7);
        assert_eq!(registry.time_limiter("search").unwrap().config(), &TimeLimiterConfig::default());
    }

    #[test]
    fn test_invalid_config_is_not_registered() {
        let registry = Registry::new();
        let bad = CircuitBreakerConfig {
            sliding_window_size: 0,
            ..Default::default()
        };

        assert!(registry.circuit_breaker_with("broken", bad).is_err());
        assert!(registry.circuit_breaker_names().is_empty());
    }

    #[test]
    fn test_register_and_remove() {
        let registry = Registry::new();
        let breaker = CircuitBreaker::builder("custom").build().unwrap();

        assert!(registry.register_circuit_breaker(breaker).is_none());
        assert!(registry.remove_circuit_breaker("custom").is_some());
        assert!(registry.circuit_breaker_names().is_empty());
    }
}
