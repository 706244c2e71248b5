//! Failure classification
//!
//! Decides which outcomes count against the breaker. "Failure" is domain
//! specific: a 404 from a lookup service is usually a correct answer, while a
//! slow success from a payment gateway may be the first sign of trouble.

use std::any::Any;
use std::time::Duration;

/// What an attempt produced
#[derive(Debug, Clone, Copy)]
pub enum Outcome<'a> {
    Success,
    /// The action returned an error (can be downcast to the concrete type)
    Error(&'a dyn Any),
    /// The attempt exceeded its deadline
    TimedOut,
}

/// Context provided to failure classifiers for outcome evaluation
#[derive(Debug)]
pub struct FailureContext<'a> {
    /// Circuit name
    pub circuit_name: &'a str,
    pub outcome: Outcome<'a>,
    /// Wall time the attempt took
    pub duration: Duration,
}

/// Classification result fed to the breaker policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Failure,
}

impl Verdict {
    pub fn is_failure(&self) -> bool {
        matches!(self, Verdict::Failure)
    }
}

/// Trait for classifying outcomes - determines what counts against the circuit
///
/// # Examples
///
/// ```rust
/// use shared_breaker::{FailureClassifier, FailureContext, Outcome, Verdict};
///
/// #[derive(Debug)]
/// struct IgnoreNotFound;
///
/// impl FailureClassifier for IgnoreNotFound {
///     fn classify(&self, ctx: &FailureContext<'_>) -> Verdict {
///         match ctx.outcome {
///             Outcome::Success => Verdict::Success,
///             Outcome::Error(e) if e.downcast_ref::<u16>() == Some(&404) => Verdict::Success,
///             _ => Verdict::Failure,
///         }
///     }
/// }
/// ```
pub trait FailureClassifier: Send + Sync + std::fmt::Debug {
    fn classify(&self, ctx: &FailureContext<'_>) -> Verdict;
}

/// Counts every error and every timeout as a failure
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl FailureClassifier for DefaultClassifier {
    fn classify(&self, ctx: &FailureContext<'_>) -> Verdict {
        match ctx.outcome {
            Outcome::Success => Verdict::Success,
            Outcome::Error(_) | Outcome::TimedOut => Verdict::Failure,
        }
    }
}

/// Predicate-based classifier using a closure
///
/// The closure returns `true` when the outcome should count as a failure.
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
    fn classify(&self, ctx: &FailureContext<'_>) -> Verdict {
        if (self.predicate)(ctx) {
            Verdict::Failure
        } else {
            Verdict::Success
        }
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

/// Treats successes slower than `threshold` as failures
///
/// Everything else is delegated to the wrapped classifier.
#[derive(Debug)]
pub struct SlowCallClassifier<C = DefaultClassifier> {
    threshold: Duration,
    inner: C,
}

impl SlowCallClassifier {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            inner: DefaultClassifier,
        }
    }
}

impl<C: FailureClassifier> SlowCallClassifier<C> {
    pub fn wrapping(threshold: Duration, inner: C) -> Self {
        Self { threshold, inner }
    }
}

impl<C: FailureClassifier> FailureClassifier for SlowCallClassifier<C> {
    fn classify(&self, ctx: &FailureContext<'_>) -> Verdict {
        match ctx.outcome {
            Outcome::Success if ctx.duration > self.threshold => Verdict::Failure,
            _ => self.inner.classify(ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(outcome: Outcome<'a>, duration_ms: u64) -> FailureContext<'a> {
        FailureContext {
            circuit_name: "test",
            outcome,
            duration: Duration::from_millis(duration_ms),
        }
    }

    #[test]
    fn test_default_classifier() {
        let classifier = DefaultClassifier;
        let err = "boom";

        assert_eq!(classifier.classify(&ctx(Outcome::Success, 5)), Verdict::Success);
        assert_eq!(
            classifier.classify(&ctx(Outcome::Error(&err), 5)),
            Verdict::Failure
        );
        assert_eq!(
            classifier.classify(&ctx(Outcome::TimedOut, 100)),
            Verdict::Failure
        );
    }

    #[test]
    fn test_predicate_classifier_status_codes() {
        #[derive(Debug)]
        enum ApiError {
            Status(u16),
        }

        // Only 5xx responses count against the circuit
        let classifier = PredicateClassifier::new(|ctx| match ctx.outcome {
            Outcome::Success => false,
            Outcome::TimedOut => true,
            Outcome::Error(e) => e
                .downcast_ref::<ApiError>()
                .map(|ApiError::Status(code)| *code >= 500)
                .unwrap_or(true),
        });

        let not_found = ApiError::Status(404);
        let unavailable = ApiError::Status(503);

        assert_eq!(
            classifier.classify(&ctx(Outcome::Error(&not_found), 1)),
            Verdict::Success
        );
        assert_eq!(
            classifier.classify(&ctx(Outcome::Error(&unavailable), 1)),
            Verdict::Failure
        );
        assert_eq!(
            classifier.classify(&ctx(Outcome::Error(&"unknown"), 1)),
            Verdict::Failure
        );
    }

    #[test]
    fn test_slow_call_classifier() {
        let classifier = SlowCallClassifier::new(Duration::from_millis(200));

        assert_eq!(classifier.classify(&ctx(Outcome::Success, 50)), Verdict::Success);
        assert_eq!(classifier.classify(&ctx(Outcome::Success, 500)), Verdict::Failure);
        assert_eq!(classifier.classify(&ctx(Outcome::TimedOut, 10)), Verdict::Failure);
    }

    #[test]
    fn test_slow_call_classifier_wraps_predicate() {
        let lenient = PredicateClassifier::new(|_| false);
        let classifier = SlowCallClassifier::wrapping(Duration::from_millis(100), lenient);

        assert_eq!(
            classifier.classify(&ctx(Outcome::Error(&"ignored"), 10)),
            Verdict::Success
        );
        assert_eq!(classifier.classify(&ctx(Outcome::Success, 150)), Verdict::Failure);
    }
}
