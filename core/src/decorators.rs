//! Decorator composer stacking protections around one operation
//!
//! Each `with_*` call wraps everything added before it, so the last layer
//! added is the outermost. The usual stack is built innermost first:
//!
//! ```text
//! Decorators::of(op)
//!     .with_retry(..)            // innermost
//!     .with_circuit_breaker(..)
//!     .with_time_limiter(..)
//!     .with_bulkhead(..)         // outermost
//! ```
//!
//! Fallbacks are applied once, around the whole stack, no matter where in
//! the chain they are declared.

use crate::bulkhead::Bulkhead;
use crate::circuit::CircuitBreaker;
use crate::errors::GuardError;
use crate::retry::Retry;
use crate::time_limiter::TimeLimiter;
use futures::future::{BoxFuture, FutureExt, TryFutureExt};
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

type Operation<T, E> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, GuardError<E>>> + Send + Sync>;
type Predicate<E> = Arc<dyn Fn(&GuardError<E>) -> bool + Send + Sync>;
type Handler<T, E> =
    Arc<dyn Fn(GuardError<E>) -> BoxFuture<'static, Result<T, GuardError<E>>> + Send + Sync>;

struct Fallback<T, E> {
    predicate: Predicate<E>,
    handler: Handler<T, E>,
}

impl<T, E> Clone for Fallback<T, E> {
    fn clone(&self) -> Self {
        Self {
            predicate: self.predicate.clone(),
            handler: self.handler.clone(),
        }
    }
}

/// Builder for a decorated call
pub struct Decorators<T, E> {
    operation: Operation<T, E>,
    layers: Vec<String>,
    fallbacks: Vec<Fallback<T, E>>,
}

impl<T, E> Decorators<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Start from a plain fallible operation
    pub fn of<F, Fut>(operation: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self::of_guarded(move || operation().map_err(GuardError::Execution))
    }

    /// Start from an operation that already reports [`GuardError`]s
    pub fn of_guarded<F, Fut>(operation: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, GuardError<E>>> + Send + 'static,
    {
        Self {
            operation: Arc::new(move || operation().boxed()),
            layers: Vec::new(),
            fallbacks: Vec::new(),
        }
    }

    fn wrap<F>(mut self, layer: String, wrap: F) -> Self
    where
        F: Fn(Operation<T, E>) -> BoxFuture<'static, Result<T, GuardError<E>>>
            + Send
            + Sync
            + 'static,
    {
        let inner = self.operation;
        self.operation = Arc::new(move || wrap(inner.clone()));
        self.layers.push(layer);
        self
    }

    pub fn with_bulkhead(self, bulkhead: &Bulkhead) -> Self {
        let bulkhead = bulkhead.clone();
        self.wrap(format!("bulkhead({})", bulkhead.name()), move |inner| {
            let bulkhead = bulkhead.clone();
            async move { bulkhead.execute(|| inner()).await }.boxed()
        })
    }

    pub fn with_circuit_breaker(self, breaker: &CircuitBreaker) -> Self {
        let breaker = breaker.clone();
        self.wrap(format!("circuit_breaker({})", breaker.name()), move |inner| {
            let breaker = breaker.clone();
            async move { breaker.execute(|| inner()).await }.boxed()
        })
    }

    pub fn with_time_limiter(self, limiter: &TimeLimiter) -> Self {
        let limiter = limiter.clone();
        self.wrap(format!("time_limiter({})", limiter.name()), move |inner| {
            let limiter = limiter.clone();
            async move { limiter.execute(|| inner()).await }.boxed()
        })
    }

    pub fn with_retry(self, retry: &Retry) -> Self {
        let retry = retry.clone();
        self.wrap(format!("retry({})", retry.name()), move |inner| {
            let retry = retry.clone();
            async move { retry.execute(|| inner()).await }.boxed()
        })
    }

    /// Recover from errors matching `predicate`
    ///
    /// Fallbacks are tried in declaration order; the first match handles the
    /// error. Unmatched errors reach the caller unchanged.
    pub fn with_fallback<P, H, Fut>(mut self, predicate: P, handler: H) -> Self
    where
        P: Fn(&GuardError<E>) -> bool + Send + Sync + 'static,
        H: Fn(GuardError<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.fallbacks.push(Fallback {
            predicate: Arc::new(predicate),
            handler: Arc::new(move |error| handler(error).map_err(GuardError::Execution).boxed()),
        });
        self
    }

    /// Layer names from innermost to outermost
    pub fn layers(&self) -> &[String] {
        &self.layers
    }

    pub fn decorate(self) -> DecoratedCall<T, E> {
        DecoratedCall {
            operation: self.operation,
            layers: self.layers.into(),
            fallbacks: self.fallbacks.into(),
        }
    }

    /// Decorate and invoke once
    pub async fn call(self) -> Result<T, GuardError<E>> {
        self.decorate().call().await
    }
}

impl<T, E> std::fmt::Debug for Decorators<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decorators")
            .field("layers", &self.layers)
            .field("fallbacks", &self.fallbacks.len())
            .finish()
    }
}

/// A fully composed, reusable call
///
/// Cloning is cheap; every clone drives the same protection instances.
pub struct DecoratedCall<T, E> {
    operation: Operation<T, E>,
    layers: Arc<[String]>,
    fallbacks: Arc<[Fallback<T, E>]>,
}

impl<T, E> Clone for DecoratedCall<T, E> {
    fn clone(&self) -> Self {
        Self {
            operation: self.operation.clone(),
            layers: self.layers.clone(),
            fallbacks: self.fallbacks.clone(),
        }
    }
}

impl<T, E> DecoratedCall<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    pub async fn call(&self) -> Result<T, GuardError<E>> {
        let error = match (self.operation)().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        match self.fallbacks.iter().find(|fallback| (fallback.predicate)(&error)) {
            Some(fallback) => {
                debug!(layers = ?self.layers, "Applying fallback");
                (fallback.handler)(error).await
            }
            None => Err(error),
        }
    }

    pub fn layers(&self) -> &[String] {
        &self.layers
    }
}

impl<T, E> std::fmt::Debug for DecoratedCall<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoratedCall")
            .field("layers", &self.layers)
            .field("fallbacks", &self.fallbacks.len())
            .finish()
    }
}
