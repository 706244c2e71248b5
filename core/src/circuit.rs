//! Circuit breaker state machine over a shared store
//!
//! Every decision is a read-decide-write cycle against the `StateStore`:
//! read the record, apply the transition table, and commit with
//! compare-and-swap. A conflict means another caller (possibly in another
//! process) got there first; the cycle re-reads and decides again against
//! the new record, up to `cas_retry_limit` times.
//!
//! | From     | Trigger                           | To       |
//! |----------|-----------------------------------|----------|
//! | Closed   | policy says open                  | Open     |
//! | Open     | call before `open_until`          | rejected |
//! | Open     | call after `open_until`           | HalfOpen (caller is the probe) |
//! | HalfOpen | probe succeeds                    | Closed   |
//! | HalfOpen | probe fails                       | Open     |
//! | HalfOpen | call while probe in flight        | rejected |
//! | HalfOpen | trial call outlives `probe_lease` | call times out; a lost claim's outcome is ignored |

use crate::{
    CircuitState,
    callbacks::{Callbacks, StateChange},
    classifier::{FailureClassifier, FailureContext, Outcome, Verdict},
    clock::Clock,
    config::{BreakerConfig, StoreUnavailablePolicy},
    errors::{CircuitError, ConfigError, StoreError},
    record::{CircuitRecord, Version, Versioned},
    retry::jittered,
    storage::{CasOutcome, StateStore},
};
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Context provided to fallback closures
#[derive(Debug)]
pub struct FallbackContext<E> {
    /// Circuit name
    pub circuit_name: String,
    /// Breaker state behind a rejection, `None` when the action itself failed
    pub state: Option<CircuitState>,
    /// Why the fallback is being used
    pub reason: CircuitError<E>,
}

/// Type alias for fallback function
pub type FallbackFn<T, E> = Box<dyn FnOnce(FallbackContext<E>) -> Result<T, E> + Send>;

/// Options for circuit breaker calls
pub struct CallOptions<T, E> {
    /// Called instead of surfacing rejections and classified failures
    pub fallback: Option<FallbackFn<T, E>>,
}

impl<T, E> Default for CallOptions<T, E> {
    fn default() -> Self {
        Self { fallback: None }
    }
}

impl<T, E> CallOptions<T, E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback<F>(mut self, f: F) -> Self
    where
        F: FnOnce(FallbackContext<E>) -> Result<T, E> + Send + 'static,
    {
        self.fallback = Some(Box::new(f));
        self
    }
}

/// Shared by every clone of a breaker
pub(crate) struct CircuitContext {
    pub name: String,
    pub config: BreakerConfig,
    pub store_policy: StoreUnavailablePolicy,
    pub store: Arc<dyn StateStore>,
    pub classifier: Arc<dyn FailureClassifier>,
    pub clock: Arc<dyn Clock>,
    pub callbacks: Callbacks,
}

impl std::fmt::Debug for CircuitContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitContext")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("store", &self.store)
            .field("classifier", &self.classifier)
            .field("callbacks", &self.callbacks)
            .finish()
    }
}

enum Admission {
    Closed,
    /// This caller holds the half-open trial slot until `lease` runs out
    Probe { claim: Version, lease: Duration },
    Open { retry_after: Option<Duration> },
    ProbeInFlight,
}

/// What one attempt of the action produced, before classification
enum RawOutcome<T, E> {
    Returned(Result<T, E>),
    TimedOut(Duration),
}

/// Circuit breaker public API
///
/// Cloning is cheap; clones share the store, classifier, clock and
/// callbacks. Independent keys are independent breakers.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    ctx: Arc<CircuitContext>,
}

impl CircuitBreaker {
    /// Create a breaker backed by an in-memory store (use builder() for more
    /// options)
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Result<Self, ConfigError> {
        crate::builder::CircuitBuilder::new(name).config(config).build()
    }

    pub fn builder(name: impl Into<String>) -> crate::builder::CircuitBuilder {
        crate::builder::CircuitBuilder::new(name)
    }

    pub(crate) fn from_context(ctx: CircuitContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    /// Breaker key in the shared store
    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.ctx.config
    }

    /// Execute an async operation with circuit breaker protection
    pub async fn call<T, E, F, Fut>(&self, action: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: 'static,
    {
        self.execute(action, CallOptions::default()).await
    }

    /// Execute with options; a fallback replaces rejections, timeouts,
    /// classified failures and store errors with its own result
    #[tracing::instrument(skip_all, fields(circuit = %self.ctx.name))]
    pub async fn execute<T, E, F, Fut>(
        &self,
        action: F,
        options: CallOptions<T, E>,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: 'static,
    {
        let result = self.attempt(action).await;

        match (result, options.fallback) {
            (Err(reason), Some(fallback)) if reason.is_fallback_eligible() => {
                self.fall_back(reason, fallback)
            }
            (result, _) => result,
        }
    }

    /// Hand `reason` to the caller's fallback
    pub(crate) fn fall_back<T, E>(
        &self,
        reason: CircuitError<E>,
        fallback: FallbackFn<T, E>,
    ) -> Result<T, CircuitError<E>> {
        debug!(circuit = %self.ctx.name, "using fallback");
        let ctx = FallbackContext {
            circuit_name: self.ctx.name.clone(),
            state: reason.observed_state(),
            reason,
        };
        fallback(ctx).map_err(CircuitError::Execution)
    }

    /// One guarded attempt: admission, the action under its timeout,
    /// classification, and the recorded outcome
    async fn attempt<T, E, F, Fut>(&self, action: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: 'static,
    {
        let (claim, limit) = match self.admit().await {
            Ok(Admission::Closed) => (None, self.ctx.config.per_attempt_timeout),
            Ok(Admission::Probe { claim, lease }) => {
                let limit = self
                    .ctx
                    .config
                    .per_attempt_timeout
                    .map_or(lease, |timeout| timeout.min(lease));
                (Some(claim), Some(limit))
            }
            Ok(Admission::Open { retry_after }) => {
                debug!(circuit = %self.ctx.name, ?retry_after, "rejected, circuit open");
                return Err(CircuitError::Open {
                    circuit: self.ctx.name.clone(),
                    retry_after,
                });
            }
            Ok(Admission::ProbeInFlight) => {
                debug!(circuit = %self.ctx.name, "rejected, probe in flight");
                return Err(CircuitError::ProbeInFlight {
                    circuit: self.ctx.name.clone(),
                });
            }
            Err(source) if self.escalates(&source) => {
                warn!(circuit = %self.ctx.name, error = %source, "state store failed, rejecting call");
                return Err(CircuitError::Store {
                    circuit: self.ctx.name.clone(),
                    source,
                });
            }
            Err(source) => {
                warn!(circuit = %self.ctx.name, error = %source, "state store failed, calling through");
                let (raw, duration) = self.run(action, self.ctx.config.per_attempt_timeout).await;
                let verdict = self.classify(&raw, duration);
                return self.settle(raw, verdict);
            }
        };

        let (raw, duration) = self.run(action, limit).await;
        let verdict = self.classify(&raw, duration);

        if let Err(source) = self.record(verdict, claim).await {
            let escalate = self.escalates(&source);
            warn!(circuit = %self.ctx.name, error = %source, escalate, "outcome not recorded");
            if escalate {
                return Err(CircuitError::Store {
                    circuit: self.ctx.name.clone(),
                    source,
                });
            }
        }

        self.settle(raw, verdict)
    }

    /// Contention surfaces under either store policy
    fn escalates(&self, err: &StoreError) -> bool {
        matches!(err, StoreError::Contention { .. })
            || self.ctx.store_policy == StoreUnavailablePolicy::FailClosed
    }

    async fn run<T, E, F, Fut>(&self, action: F, limit: Option<Duration>) -> (RawOutcome<T, E>, Duration)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let raw = match limit {
            Some(limit) => match tokio::time::timeout(limit, action()).await {
                Ok(returned) => RawOutcome::Returned(returned),
                Err(_) => RawOutcome::TimedOut(limit),
            },
            None => RawOutcome::Returned(action().await),
        };
        (raw, started.elapsed())
    }

    fn classify<T, E: 'static>(&self, raw: &RawOutcome<T, E>, duration: Duration) -> Verdict {
        let outcome = match raw {
            RawOutcome::Returned(Ok(_)) => Outcome::Success,
            RawOutcome::Returned(Err(e)) => Outcome::Error(e as &dyn Any),
            RawOutcome::TimedOut(_) => Outcome::TimedOut,
        };
        self.ctx.classifier.classify(&FailureContext {
            circuit_name: &self.ctx.name,
            outcome,
            duration,
        })
    }

    fn settle<T, E>(&self, raw: RawOutcome<T, E>, verdict: Verdict) -> Result<T, CircuitError<E>> {
        match raw {
            RawOutcome::Returned(Ok(value)) => Ok(value),
            RawOutcome::Returned(Err(source)) if verdict.is_failure() => Err(CircuitError::Failure {
                circuit: self.ctx.name.clone(),
                source,
            }),
            RawOutcome::Returned(Err(source)) => Err(CircuitError::Execution(source)),
            RawOutcome::TimedOut(timeout) => Err(CircuitError::Timeout {
                circuit: self.ctx.name.clone(),
                timeout,
            }),
        }
    }

    /// Decide whether this caller may run the action
    async fn admit(&self) -> Result<Admission, StoreError> {
        let limit = self.ctx.config.cas_retry_limit;

        for _ in 0..limit {
            let now = self.ctx.clock.now_millis();
            let (record, version) = self.load(now).await?;

            match record.state {
                CircuitState::Closed => return Ok(Admission::Closed),
                CircuitState::Open if !record.open_expired(now) => {
                    return Ok(Admission::Open {
                        retry_after: record.retry_after(now),
                    });
                }
                CircuitState::HalfOpen if record.probe_in_flight(now) => {
                    return Ok(Admission::ProbeInFlight);
                }
                from => {
                    let lease = self.ctx.config.probe_lease;
                    let claimed = record.probing(now, lease);
                    match self.swap(version, &claimed, None).await? {
                        CasOutcome::Swapped(claim) => {
                            if from == CircuitState::Open {
                                self.ctx.callbacks.fire(&StateChange {
                                    circuit: &self.ctx.name,
                                    from,
                                    to: CircuitState::HalfOpen,
                                    at: now,
                                });
                            }
                            debug!(circuit = %self.ctx.name, "claimed half-open probe");
                            // What is left of the lease after the claim round-trip
                            let expires = claimed.probe_expires_at.unwrap_or(now);
                            let left = expires.saturating_sub(self.ctx.clock.now_millis());
                            return Ok(Admission::Probe {
                                claim,
                                lease: lease.min(Duration::from_millis(left)),
                            });
                        }
                        CasOutcome::Conflict => continue,
                    }
                }
            }
        }

        Err(StoreError::Contention { attempts: limit })
    }

    /// Fold a verdict into the shared record
    ///
    /// A trial call passes the version its claim was committed under; its
    /// verdict only counts while that claim is still the stored record.
    async fn record(&self, verdict: Verdict, claim: Option<Version>) -> Result<(), StoreError> {
        let limit = self.ctx.config.cas_retry_limit;

        for _ in 0..limit {
            let now = self.ctx.clock.now_millis();
            let (record, version) = self.load(now).await?;

            let (next, ttl) = match (record.state, claim) {
                (CircuitState::HalfOpen, Some(claim)) if version == Some(claim) => match verdict {
                    Verdict::Success => (CircuitRecord::closed(now), None),
                    Verdict::Failure => self.trip(&record, now),
                },
                (CircuitState::Closed, None) => {
                    let transition = self.ctx.config.policy.decide(&record, verdict, now);
                    if transition.opens() {
                        self.trip(&transition.into_record(), now)
                    } else {
                        (transition.into_record(), None)
                    }
                }
                // Another caller already moved the circuit on, or the lease
                // ran out and someone else holds the trial slot now
                (state, _) => {
                    debug!(circuit = %self.ctx.name, %state, ?verdict, "outcome not counted");
                    return Ok(());
                }
            };

            match self.swap(version, &next, ttl).await? {
                CasOutcome::Swapped(_) => {
                    if next.state != record.state {
                        self.ctx.callbacks.fire(&StateChange {
                            circuit: &self.ctx.name,
                            from: record.state,
                            to: next.state,
                            at: now,
                        });
                    } else {
                        debug!(
                            circuit = %self.ctx.name,
                            consecutive_failures = next.consecutive_failures,
                            window_failures = next.window_failures,
                            window_successes = next.window_successes,
                            "outcome recorded"
                        );
                    }
                    return Ok(());
                }
                CasOutcome::Conflict => {
                    debug!(circuit = %self.ctx.name, "record changed underneath, re-reading");
                }
            }
        }

        Err(StoreError::Contention { attempts: limit })
    }

    /// Open record plus its TTL when open records self-expire
    fn trip(&self, record: &CircuitRecord, now: u64) -> (CircuitRecord, Option<Duration>) {
        let open_for = jittered(self.ctx.config.open_duration, self.ctx.config.jitter_factor);
        let ttl = self.ctx.config.self_expiring_open.then_some(open_for);
        (record.opened(now, open_for), ttl)
    }

    async fn load(&self, now: u64) -> Result<(CircuitRecord, Option<Version>), StoreError> {
        let read = self.bounded(self.ctx.store.read(&self.ctx.name)).await?;
        Ok(match read {
            Some(Versioned { record, version }) => (record, Some(version)),
            None => (CircuitRecord::closed(now), None),
        })
    }

    async fn swap(
        &self,
        expected: Option<Version>,
        record: &CircuitRecord,
        ttl: Option<Duration>,
    ) -> Result<CasOutcome, StoreError> {
        self.bounded(
            self.ctx
                .store
                .compare_and_swap(&self.ctx.name, expected, record, ttl),
        )
        .await
    }

    /// Run a store operation under `store_timeout`
    async fn bounded<R>(
        &self,
        op: impl Future<Output = Result<R, StoreError>>,
    ) -> Result<R, StoreError> {
        let limit = self.ctx.config.store_timeout;
        tokio::time::timeout(limit, op)
            .await
            .map_err(|_| StoreError::Timeout(limit))?
    }

    /// Current state as stored; an absent record is `Closed`
    pub async fn state(&self) -> Result<CircuitState, StoreError> {
        let now = self.ctx.clock.now_millis();
        Ok(self.load(now).await?.0.state)
    }

    /// Current record and version, `None` before first use
    pub async fn snapshot(&self) -> Result<Option<Versioned>, StoreError> {
        self.bounded(self.ctx.store.read(&self.ctx.name)).await
    }

    pub async fn is_open(&self) -> Result<bool, StoreError> {
        Ok(self.state().await? == CircuitState::Open)
    }

    pub async fn is_closed(&self) -> Result<bool, StoreError> {
        Ok(self.state().await? == CircuitState::Closed)
    }

    /// Overwrite the shared record with a fresh `Closed` one
    pub async fn reset(&self) -> Result<(), StoreError> {
        let record = CircuitRecord::closed(self.ctx.clock.now_millis());
        self.bounded(self.ctx.store.write(&self.ctx.name, &record))
            .await?;
        tracing::info!(circuit = %self.ctx.name, "circuit reset");
        Ok(())
    }

    /// Record a successful operation (for manual tracking)
    pub async fn record_success(&self) -> Result<(), StoreError> {
        self.record(Verdict::Success, None).await
    }

    /// Record a failed operation (for manual tracking)
    pub async fn record_failure(&self) -> Result<(), StoreError> {
        self.record(Verdict::Failure, None).await
    }
}
