//! Error types for circuit breaker operations

use crate::CircuitState;
use std::error::Error;
use std::fmt;
use std::time::Duration;

/// Failures of the shared state store itself
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("state store did not answer within {0:?}")]
    Timeout(Duration),
    #[error("state store unavailable: {0}")]
    Unavailable(String),
    #[error("gave up after {attempts} conflicting compare-and-swap attempts")]
    Contention { attempts: u32 },
    #[error("stored circuit record is unreadable: {0}")]
    Corrupt(String),
}

/// Rejected breaker configuration
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("store_unavailable_policy must be set explicitly (fail_open or fail_closed)")]
    MissingStoreUnavailablePolicy,
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors that can occur during circuit breaker operations
///
/// `E` is the caller's own error type. It is never wrapped in a transport
/// error; callers match on the variant to decide remediation.
#[derive(Debug)]
pub enum CircuitError<E = Box<dyn Error + Send + Sync>> {
    /// The action ran and its outcome was classified as a failure
    Failure { circuit: String, source: E },
    /// Circuit is open, the action was not invoked
    Open {
        circuit: String,
        retry_after: Option<Duration>,
    },
    /// Circuit is half-open and another caller holds the probe slot
    ProbeInFlight { circuit: String },
    /// A single attempt exceeded the per-attempt timeout
    Timeout { circuit: String, timeout: Duration },
    /// Every attempt failed; `last` is the final attempt's error
    RetriesExhausted {
        circuit: String,
        attempts: u32,
        last: Box<CircuitError<E>>,
    },
    /// The state store failed and the breaker is configured to fail closed,
    /// or the compare-and-swap budget ran out
    Store { circuit: String, source: StoreError },
    /// The caller cancelled the operation
    Cancelled { circuit: String },
    /// Caller error passed through untouched: either an action error the
    /// classifier did not count as a failure, or an error from the fallback
    Execution(E),
}

impl<E> CircuitError<E> {
    /// Breaker short-circuited without running the action
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            CircuitError::Open { .. } | CircuitError::ProbeInFlight { .. }
        )
    }

    /// Worth another attempt through the retry layer
    pub fn is_retryable(&self) -> bool {
        matches!(self, CircuitError::Failure { .. })
    }

    /// Eligible for the caller's fallback
    pub fn is_fallback_eligible(&self) -> bool {
        !matches!(
            self,
            CircuitError::Execution(_) | CircuitError::Cancelled { .. }
        )
    }

    /// State the breaker was observed in when this error was produced
    pub fn observed_state(&self) -> Option<CircuitState> {
        match self {
            CircuitError::Open { .. } => Some(CircuitState::Open),
            CircuitError::ProbeInFlight { .. } => Some(CircuitState::HalfOpen),
            CircuitError::RetriesExhausted { last, .. } => last.observed_state(),
            _ => None,
        }
    }

    /// The caller's error value, when one exists
    pub fn into_inner(self) -> Option<E> {
        match self {
            CircuitError::Failure { source, .. } => Some(source),
            CircuitError::Execution(e) => Some(e),
            CircuitError::RetriesExhausted { last, .. } => last.into_inner(),
            _ => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for CircuitError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitError::Failure { circuit, source } => {
                write!(f, "Circuit '{}' call failed: {}", circuit, source)
            }
            CircuitError::Open {
                circuit,
                retry_after: Some(after),
            } => write!(f, "Circuit '{}' is open (retry after {:?})", circuit, after),
            CircuitError::Open { circuit, .. } => write!(f, "Circuit '{}' is open", circuit),
            CircuitError::ProbeInFlight { circuit } => {
                write!(f, "Circuit '{}' is half-open, probe already in flight", circuit)
            }
            CircuitError::Timeout { circuit, timeout } => {
                write!(f, "Circuit '{}' call timed out after {:?}", circuit, timeout)
            }
            CircuitError::RetriesExhausted {
                circuit,
                attempts,
                last,
            } => write!(
                f,
                "Circuit '{}' gave up after {} attempts: {}",
                circuit, attempts, last
            ),
            CircuitError::Store { circuit, source } => {
                write!(f, "Circuit '{}' state store error: {}", circuit, source)
            }
            CircuitError::Cancelled { circuit } => write!(f, "Circuit '{}' call cancelled", circuit),
            CircuitError::Execution(e) => write!(f, "Circuit execution failed: {}", e),
        }
    }
}

impl<E: Error + 'static> Error for CircuitError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CircuitError::Failure { source, .. } => Some(source),
            CircuitError::Execution(e) => Some(e),
            CircuitError::RetriesExhausted { last, .. } => Some(last.as_ref()),
            CircuitError::Store { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_kinds() {
        let open: CircuitError<String> = CircuitError::Open {
            circuit: "api".into(),
            retry_after: None,
        };
        let probe: CircuitError<String> = CircuitError::ProbeInFlight {
            circuit: "api".into(),
        };
        let failure: CircuitError<String> = CircuitError::Failure {
            circuit: "api".into(),
            source: "boom".into(),
        };

        assert!(open.is_rejection());
        assert!(probe.is_rejection());
        assert!(!failure.is_rejection());
        assert!(failure.is_retryable());
        assert!(!open.is_retryable());
    }

    #[test]
    fn test_execution_not_fallback_eligible() {
        let err: CircuitError<&str> = CircuitError::Execution("not found");
        assert!(!err.is_fallback_eligible());
        assert_eq!(err.into_inner(), Some("not found"));
    }

    #[test]
    fn test_retries_exhausted_display_and_inner() {
        let err: CircuitError<String> = CircuitError::RetriesExhausted {
            circuit: "db".into(),
            attempts: 3,
            last: Box::new(CircuitError::Failure {
                circuit: "db".into(),
                source: "connection reset".into(),
            }),
        };

        assert_eq!(
            err.to_string(),
            "Circuit 'db' gave up after 3 attempts: Circuit 'db' call failed: connection reset"
        );
        assert_eq!(err.into_inner(), Some("connection reset".to_string()));
    }

    #[test]
    fn test_store_error_source_chain() {
        let err: CircuitError<std::io::Error> = CircuitError::Store {
            circuit: "db".into(),
            source: StoreError::Contention { attempts: 5 },
        };
        assert!(err.source().is_some());
        assert!(err.to_string().contains("5 conflicting"));
    }
}
