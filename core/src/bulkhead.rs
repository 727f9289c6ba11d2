//! Bulkhead implementation for concurrency limiting
//!
//! A semaphore-based bulkhead caps the number of calls in flight. Callers that
//! find it full wait in FIFO order for at most `max_wait_duration`, then give
//! up with [`BulkheadFull`].

use crate::clock::{Clock, TokioClock};
use crate::errors::{BulkheadFull, ConfigError, GuardError};
use crate::events::{BulkheadEventKind, DEFAULT_EVENT_BUFFER, Event, EventPublisher};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast};
use tracing::debug;

/// Bulkhead configuration
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct BulkheadConfig {
    /// Maximum number of calls running at once
    pub max_concurrent_calls: usize,
    /// How long a caller may queue for a slot; zero rejects immediately
    pub max_wait_duration: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 25,
            max_wait_duration: Duration::ZERO,
        }
    }
}

impl BulkheadConfig {
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.max_concurrent_calls == 0 {
            return Err(ConfigError::invalid(
                name,
                "max_concurrent_calls must be greater than 0",
            ));
        }
        if self.max_concurrent_calls > Semaphore::MAX_PERMITS {
            return Err(ConfigError::invalid(
                name,
                format!(
                    "max_concurrent_calls must be at most {}",
                    Semaphore::MAX_PERMITS
                ),
            ));
        }
        Ok(())
    }
}

/// Current bulkhead usage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadMetrics {
    pub available_concurrent_calls: usize,
    pub max_allowed_concurrent_calls: usize,
    pub rejected_calls: u64,
}

struct BulkheadInner {
    name: String,
    config: BulkheadConfig,
    semaphore: Arc<Semaphore>,
    clock: Arc<dyn Clock>,
    events: EventPublisher<BulkheadEventKind>,
    rejected: AtomicU64,
}

/// A semaphore-based bulkhead for limiting concurrent operations
///
/// Cloning is cheap and clones share the same slots.
#[derive(Clone)]
pub struct Bulkhead {
    inner: Arc<BulkheadInner>,
}

impl Bulkhead {
    pub fn new(name: impl Into<String>, config: BulkheadConfig) -> Result<Self, ConfigError> {
        Self::builder(name).config(config).build()
    }

    pub fn builder(name: impl Into<String>) -> BulkheadBuilder {
        BulkheadBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &BulkheadConfig {
        &self.inner.config
    }

    /// Get the maximum number of permits (bulkhead limit)
    pub fn limit(&self) -> usize {
        self.inner.config.max_concurrent_calls
    }

    /// Get the number of available permits
    pub fn available(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    /// Get the current number of acquired permits
    pub fn acquired(&self) -> usize {
        self.limit().saturating_sub(self.available())
    }

    pub fn metrics(&self) -> BulkheadMetrics {
        BulkheadMetrics {
            available_concurrent_calls: self.available(),
            max_allowed_concurrent_calls: self.limit(),
            rejected_calls: self.inner.rejected.load(Ordering::Relaxed),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event<BulkheadEventKind>> {
        self.inner.events.subscribe()
    }

    /// Try to acquire a permit without waiting
    ///
    /// Returns `None` if the bulkhead is at capacity or callers are queued.
    pub fn try_acquire(&self) -> Option<BulkheadGuard> {
        match self.inner.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Some(self.permitted(permit)),
            Err(_) => None,
        }
    }

    /// Non-waiting admission check
    ///
    /// A full bulkhead with a non-zero `max_wait_duration` answers
    /// [`Admission::WaitUntil`]; [`Bulkhead::acquire`] performs that wait.
    pub fn try_acquire_permission(&self) -> Admission {
        if let Some(guard) = self.try_acquire() {
            return Admission::Permitted(guard);
        }
        let max_wait = self.inner.config.max_wait_duration;
        if max_wait.is_zero() {
            Admission::Rejected(self.rejected())
        } else {
            Admission::WaitUntil(self.inner.clock.now().checked_add(max_wait))
        }
    }

    /// Acquire a permit, queueing for at most `max_wait_duration`
    pub async fn acquire(&self) -> Result<BulkheadGuard, BulkheadFull> {
        let deadline = match self.try_acquire_permission() {
            Admission::Permitted(guard) => return Ok(guard),
            Admission::Rejected(full) => return Err(full),
            Admission::WaitUntil(deadline) => deadline,
        };

        let Some(deadline) = deadline else {
            return match self.inner.semaphore.clone().acquire_owned().await {
                Ok(permit) => Ok(self.permitted(permit)),
                Err(_) => Err(self.rejected()),
            };
        };

        let timer = self
            .inner
            .clock
            .sleep(deadline.saturating_duration_since(self.inner.clock.now()));
        tokio::select! {
            biased;
            permit = self.inner.semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => Ok(self.permitted(permit)),
                Err(_) => Err(self.rejected()),
            },
            _ = timer => Err(self.rejected()),
        }
    }

    /// Execute an operation inside the bulkhead
    ///
    /// The slot is held until the operation's future completes or is dropped.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, GuardError<E>>>,
    {
        let _guard = self.acquire().await?;
        operation().await
    }

    /// Execute a plain fallible operation inside the bulkhead
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let _guard = self.acquire().await?;
        operation().await.map_err(GuardError::Execution)
    }

    fn permitted(&self, permit: OwnedSemaphorePermit) -> BulkheadGuard {
        self.inner
            .events
            .publish(self.inner.clock.now(), BulkheadEventKind::CallPermitted);
        BulkheadGuard {
            bulkhead: self.inner.clone(),
            _permit: permit,
        }
    }

    fn rejected(&self) -> BulkheadFull {
        self.inner.rejected.fetch_add(1, Ordering::Relaxed);
        debug!(
            bulkhead = %self.inner.name,
            max_concurrent_calls = self.limit(),
            "Bulkhead full, rejecting call"
        );
        self.inner
            .events
            .publish(self.inner.clock.now(), BulkheadEventKind::CallRejected);
        BulkheadFull {
            bulkhead: self.inner.name.clone(),
            max_concurrent_calls: self.limit(),
        }
    }
}

impl std::fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bulkhead")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .field("available", &self.available())
            .finish()
    }
}

/// Result of [`Bulkhead::try_acquire_permission`]
#[derive(Debug)]
pub enum Admission {
    Permitted(BulkheadGuard),
    /// Full; a caller may queue for a slot until this instant, or without
    /// limit when the wait is too long to represent
    WaitUntil(Option<Instant>),
    Rejected(BulkheadFull),
}

/// Guard that releases a bulkhead permit when dropped
///
/// This ensures that permits are always released, even if the guarded
/// operation panics or is cancelled.
pub struct BulkheadGuard {
    bulkhead: Arc<BulkheadInner>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for BulkheadGuard {
    fn drop(&mut self) {
        self.bulkhead
            .events
            .publish(self.bulkhead.clock.now(), BulkheadEventKind::CallFinished);
    }
}

impl std::fmt::Debug for BulkheadGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkheadGuard")
            .field("bulkhead", &self.bulkhead.name)
            .finish()
    }
}

/// Builder for [`Bulkhead`]
pub struct BulkheadBuilder {
    name: String,
    config: BulkheadConfig,
    clock: Option<Arc<dyn Clock>>,
    event_buffer: usize,
}

impl BulkheadBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: BulkheadConfig::default(),
            clock: None,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    pub fn config(mut self, config: BulkheadConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_concurrent_calls(mut self, limit: usize) -> Self {
        self.config.max_concurrent_calls = limit;
        self
    }

    pub fn max_wait_duration(mut self, wait: Duration) -> Self {
        self.config.max_wait_duration = wait;
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

    pub fn build(self) -> Result<Bulkhead, ConfigError> {
        self.config.validate(&self.name)?;
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_calls));
        Ok(Bulkhead {
            inner: Arc::new(BulkheadInner {
                events: EventPublisher::new(&self.name, self.event_buffer),
                name: self.name,
                config: self.config,
                semaphore,
                clock: self.clock.unwrap_or_else(|| Arc::new(TokioClock)),
                rejected: AtomicU64::new(0),
            }),
        })
    }
}
