//! Builder API for ergonomic circuit breaker configuration

use crate::{
    MemoryStore, StateStore,
    callbacks::{Callbacks, StateChange, hook},
    circuit::{CircuitBreaker, CircuitContext},
    classifier::{DefaultClassifier, FailureClassifier},
    clock::{Clock, SystemClock},
    config::{BreakerConfig, StoreUnavailablePolicy},
    errors::ConfigError,
    policy::BreakerPolicy,
};
use std::sync::Arc;
use std::time::Duration;

/// Builder for creating circuit breakers with fluent API
pub struct CircuitBuilder {
    name: String,
    config: BreakerConfig,
    store: Option<Arc<dyn StateStore>>,
    failure_classifier: Option<Arc<dyn FailureClassifier>>,
    clock: Option<Arc<dyn Clock>>,
    callbacks: Callbacks,
}

impl CircuitBuilder {
    /// Create a new builder for a circuit with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: BreakerConfig::default(),
            store: None,
            failure_classifier: None,
            clock: None,
            callbacks: Callbacks::new(),
        }
    }

    /// Replace the whole configuration, e.g. one loaded from a file
    pub fn config(mut self, config: BreakerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the trip strategy
    pub fn policy(mut self, policy: BreakerPolicy) -> Self {
        self.config.policy = policy;
        self
    }

    /// Shorthand for `BreakerPolicy::ConsecutiveFailure`
    pub fn failure_threshold(self, threshold: u32) -> Self {
        self.policy(BreakerPolicy::ConsecutiveFailure {
            failure_threshold: threshold,
        })
    }

    /// Set how long the circuit stays open before a probe is admitted
    pub fn open_duration(mut self, duration: Duration) -> Self {
        self.config.open_duration = duration;
        self
    }

    /// Set the jitter factor (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: duration * (1 - jitter + rand * jitter)
    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.config.jitter_factor = factor;
        self
    }

    pub fn per_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.config.per_attempt_timeout = Some(timeout);
        self
    }

    /// Retries made by `ExecutionPipeline` after the first attempt
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.config.base_backoff = base;
        self.config.max_backoff = max;
        self
    }

    pub fn retry_jitter(mut self, factor: f64) -> Self {
        self.config.retry_jitter = factor;
        self
    }

    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.config.store_timeout = timeout;
        self
    }

    pub fn cas_retry_limit(mut self, limit: u32) -> Self {
        self.config.cas_retry_limit = limit;
        self
    }

    pub fn probe_lease(mut self, lease: Duration) -> Self {
        self.config.probe_lease = lease;
        self
    }

    /// Let open records expire straight back to `Closed` in the store
    pub fn self_expiring_open(mut self, enabled: bool) -> Self {
        self.config.self_expiring_open = enabled;
        self
    }

    pub fn store_unavailable_policy(mut self, policy: StoreUnavailablePolicy) -> Self {
        self.config.store_unavailable_policy = Some(policy);
        self
    }

    /// Let calls through when the store is unreachable
    pub fn fail_open(self) -> Self {
        self.store_unavailable_policy(StoreUnavailablePolicy::FailOpen)
    }

    /// Reject calls when the store is unreachable
    pub fn fail_closed(self) -> Self {
        self.store_unavailable_policy(StoreUnavailablePolicy::FailClosed)
    }

    /// Set the shared store; defaults to a private `MemoryStore`
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the time source for record timestamps
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set a failure classifier to filter which outcomes should trip the
    /// circuit
    ///
    /// Use this to ignore "expected" errors like validation failures or
    /// client errors (4xx), while still tripping on server errors (5xx).
    ///
    /// # Examples
    ///
    /// ```rust
    /// use shared_breaker::{CircuitBreaker, Outcome, PredicateClassifier};
    /// use std::sync::Arc;
    /// use std::time::Duration;
    ///
    /// let circuit = CircuitBreaker::builder("api")
    ///     .failure_classifier(Arc::new(PredicateClassifier::new(|ctx| {
    ///         // Only trip on errors that also took long
    ///         matches!(ctx.outcome, Outcome::Error(_)) && ctx.duration > Duration::from_secs(1)
    ///     })))
    ///     .fail_open()
    ///     .build()
    ///     .unwrap();
    /// ```
    pub fn failure_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.failure_classifier = Some(classifier);
        self
    }

    /// Set callback for when this process opens the circuit
    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&StateChange<'_>) + Send + Sync + 'static,
    {
        self.callbacks.on_open = Some(hook(f));
        self
    }

    /// Set callback for when this process closes the circuit
    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&StateChange<'_>) + Send + Sync + 'static,
    {
        self.callbacks.on_close = Some(hook(f));
        self
    }

    /// Set callback for when this process claims the half-open probe
    pub fn on_half_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&StateChange<'_>) + Send + Sync + 'static,
    {
        self.callbacks.on_half_open = Some(hook(f));
        self
    }

    /// Validate the configuration and build the circuit breaker
    pub fn build(self) -> Result<CircuitBreaker, ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::invalid("name", "must not be empty"));
        }
        let store_policy = self.config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::with_clock(clock.clone())));
        let classifier = self
            .failure_classifier
            .unwrap_or_else(|| Arc::new(DefaultClassifier));

        tracing::debug!(
            circuit = %self.name,
            policy = self.config.policy.name(),
            ?store_policy,
            "circuit breaker built"
        );

        Ok(CircuitBreaker::from_context(CircuitContext {
            name: self.name,
            config: self.config,
            store_policy,
            store,
            classifier,
            clock,
            callbacks: self.callbacks,
        }))
    }
}
