//! Failure classification for error filtering
//!
//! A classifier decides whether an error counts as a fault. Circuit breakers
//! record only errors classified [`Classification::CountsAsFailure`]; retries
//! only re-attempt them. Everything else passes through untouched.

use std::any::Any;
use std::time::Duration;

/// Verdict of a [`FailureClassifier`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Classification {
    /// The error is a fault and affects rates / triggers retries
    CountsAsFailure,
    /// Business error: neither a success nor a failure
    Ignored,
}

impl Classification {
    pub fn counts_as_failure(self) -> bool {
        self == Classification::CountsAsFailure
    }
}

impl From<bool> for Classification {
    fn from(counts: bool) -> Self {
        if counts {
            Classification::CountsAsFailure
        } else {
            Classification::Ignored
        }
    }
}

/// Context provided to failure classifiers for error evaluation
#[derive(Debug)]
pub struct FailureContext<'a> {
    /// Name of the breaker or retry doing the classification
    pub instance: &'a str,
    /// The error that occurred (can be downcast to specific types).
    /// Timeouts arrive as [`crate::TimedOut`].
    pub error: &'a dyn Any,
    /// Duration of the failed call
    pub duration: Duration,
}

/// Trait for classifying failures
///
/// # Examples
///
/// ```rust
/// use resilience_machines::{Classification, FailureClassifier, FailureContext};
///
/// #[derive(Debug)]
/// struct ServerErrorClassifier;
///
/// impl FailureClassifier for ServerErrorClassifier {
///     fn classify(&self, ctx: &FailureContext<'_>) -> Classification {
///         match ctx.error.downcast_ref::<u16>() {
///             Some(status) if *status < 500 => Classification::Ignored,
///             _ => Classification::CountsAsFailure,
///         }
///     }
/// }
/// ```
pub trait FailureClassifier: Send + Sync + std::fmt::Debug {
    fn classify(&self, ctx: &FailureContext<'_>) -> Classification;
}

/// Default classifier that counts every error
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl FailureClassifier for DefaultClassifier {
    fn classify(&self, _ctx: &FailureContext<'_>) -> Classification {
        Classification::CountsAsFailure
    }
}

/// Predicate-based classifier using a closure
///
/// The closure returns `true` when the error counts as a failure.
pub struct PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    predicate: F,
}

impl<F> PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> FailureClassifier for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn classify(&self, ctx: &FailureContext<'_>) -> Classification {
        (self.predicate)(ctx).into()
    }
}

impl<F> std::fmt::Debug for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateClassifier")
            .field("predicate", &"<closure>")
            .finish()
    }
}

fn is_type<T: Any>(error: &dyn Any) -> bool {
    error.is::<T>()
}

/// Type-list classifier, the equivalent of an "ignore exceptions" list
///
/// Errors whose concrete type was registered with [`TypeClassifier::ignore`]
/// are ignored. If any type was registered with [`TypeClassifier::record`],
/// only those types count; otherwise every non-ignored error counts.
#[derive(Debug, Clone, Default)]
pub struct TypeClassifier {
    ignored: Vec<fn(&dyn Any) -> bool>,
    recorded: Vec<fn(&dyn Any) -> bool>,
}

impl TypeClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ignore<T: Any>(mut self) -> Self {
        self.ignored.push(is_type::<T>);
        self
    }

    pub fn record<T: Any>(mut self) -> Self {
        self.recorded.push(is_type::<T>);
        self
    }
}

impl FailureClassifier for TypeClassifier {
    fn classify(&self, ctx: &FailureContext<'_>) -> Classification {
        if self.ignored.iter().any(|matches| matches(ctx.error)) {
            return Classification::Ignored;
        }
        if self.recorded.is_empty() {
            return Classification::CountsAsFailure;
        }
        self.recorded.iter().any(|matches| matches(ctx.error)).into()
    }
}
