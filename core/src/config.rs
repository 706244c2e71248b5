//! Breaker configuration
//!
//! One `BreakerConfig` value is handed to each `CircuitBreaker` at
//! construction. Durations (de)serialize in humantime form ("30s", "250ms").

use crate::errors::ConfigError;
use crate::policy::BreakerPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What to do when the state store cannot be reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreUnavailablePolicy {
    /// Let calls through as if the circuit were closed
    FailOpen,
    /// Reject calls as if the circuit were open
    FailClosed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub policy: BreakerPolicy,

    /// How long the circuit stays open before admitting a probe
    #[serde(with = "humantime_serde")]
    pub open_duration: Duration,

    /// Jitter applied to `open_duration` (0.0 = none, 1.0 = full)
    /// Uses chrono-machines formula: duration * (1 - jitter + rand * jitter)
    pub jitter_factor: f64,

    /// Deadline for a single attempt of the action
    #[serde(with = "humantime_serde")]
    pub per_attempt_timeout: Option<Duration>,

    /// Attempts after the first one made by the execution pipeline
    pub max_retries: u32,

    #[serde(with = "humantime_serde")]
    pub base_backoff: Duration,

    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Jitter applied to retry delays (0.0 = none, 1.0 = full)
    pub retry_jitter: f64,

    /// Deadline for each store operation
    #[serde(with = "humantime_serde")]
    pub store_timeout: Duration,

    /// Read-decide-write cycles attempted before giving up on contention
    pub cas_retry_limit: u32,

    /// How long a claimed probe slot stays reserved
    #[serde(with = "humantime_serde")]
    pub probe_lease: Duration,

    /// Write `Open` records with a TTL so they expire straight back into
    /// `Closed`, skipping the half-open probe
    pub self_expiring_open: bool,

    /// Must be set explicitly; there is no safe default
    pub store_unavailable_policy: Option<StoreUnavailablePolicy>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            policy: BreakerPolicy::default(),
            open_duration: Duration::from_secs(30),
            jitter_factor: 0.0,
            per_attempt_timeout: None,
            max_retries: 0,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            retry_jitter: 1.0,
            store_timeout: Duration::from_millis(250),
            cas_retry_limit: 5,
            probe_lease: Duration::from_secs(30),
            self_expiring_open: false,
            store_unavailable_policy: None,
        }
    }
}

impl BreakerConfig {
    /// Check every field, refusing configurations that leave
    /// `store_unavailable_policy` unset
    pub fn validate(&self) -> Result<StoreUnavailablePolicy, ConfigError> {
        match self.policy {
            BreakerPolicy::ConsecutiveFailure { failure_threshold } => {
                if failure_threshold == 0 {
                    return Err(ConfigError::invalid(
                        "failure_threshold",
                        "must be at least 1",
                    ));
                }
            }
            BreakerPolicy::ErrorRate {
                error_rate_threshold,
                sampling_duration,
                ..
            } => {
                check_rate("error_rate_threshold", error_rate_threshold)?;
                check_nonzero("sampling_duration", sampling_duration)?;
            }
            BreakerPolicy::ThroughputBased {
                volume_drop_percent,
                error_rate_threshold,
                sampling_duration,
            } => {
                if !(volume_drop_percent > 0.0 && volume_drop_percent <= 100.0) {
                    return Err(ConfigError::invalid(
                        "volume_drop_percent",
                        format!("{volume_drop_percent} is outside (0, 100]"),
                    ));
                }
                if !(0.0..1.0).contains(&error_rate_threshold) {
                    return Err(ConfigError::invalid(
                        "error_rate_threshold",
                        format!("{error_rate_threshold} is outside [0, 1)"),
                    ));
                }
                check_nonzero("sampling_duration", sampling_duration)?;
            }
        }

        check_nonzero("open_duration", self.open_duration)?;
        check_nonzero("store_timeout", self.store_timeout)?;
        check_nonzero("probe_lease", self.probe_lease)?;
        check_factor("jitter_factor", self.jitter_factor)?;
        check_factor("retry_jitter", self.retry_jitter)?;

        if let Some(timeout) = self.per_attempt_timeout {
            check_nonzero("per_attempt_timeout", timeout)?;
            if self.probe_lease < timeout {
                return Err(ConfigError::invalid(
                    "probe_lease",
                    format!(
                        "{:?} is shorter than per_attempt_timeout {:?}",
                        self.probe_lease, timeout
                    ),
                ));
            }
        }

        if self.base_backoff > self.max_backoff {
            return Err(ConfigError::invalid(
                "base_backoff",
                format!(
                    "{:?} exceeds max_backoff {:?}",
                    self.base_backoff, self.max_backoff
                ),
            ));
        }

        if self.cas_retry_limit == 0 {
            return Err(ConfigError::invalid("cas_retry_limit", "must be at least 1"));
        }

        self.store_unavailable_policy
            .ok_or(ConfigError::MissingStoreUnavailablePolicy)
    }
}

fn check_rate(field: &'static str, rate: f64) -> Result<(), ConfigError> {
    if rate > 0.0 && rate <= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("{rate} is outside (0, 1]")))
    }
}

fn check_factor(field: &'static str, factor: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&factor) {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("{factor} is outside [0, 1]")))
    }
}

fn check_nonzero(field: &'static str, duration: Duration) -> Result<(), ConfigError> {
    if duration.is_zero() {
        Err(ConfigError::invalid(field, "must be greater than zero"))
    } else {
        Ok(())
    }
}
