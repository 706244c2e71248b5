//! Retry backoff
//!
//! Delays grow exponentially from `base_backoff`, capped at `max_backoff`,
//! then jittered with chrono-machines so callers that failed together do not
//! retry together.

use crate::config::BreakerConfig;
use std::time::Duration;

/// Apply chrono-machines jitter to `duration`
///
/// Formula: duration * (1 - factor + rand * factor), so the result lies in
/// `[duration * (1 - factor), duration]`.
pub(crate) fn jittered(duration: Duration, factor: f64) -> Duration {
    let ms = duration.as_millis() as u64;
    if factor <= 0.0 || ms == 0 {
        return duration;
    }

    let policy = chrono_machines::Policy {
        max_attempts: 1,
        base_delay_ms: ms,
        multiplier: 1.0,
        max_delay_ms: ms,
    };
    let delay_ms = policy.calculate_delay(1, factor);
    Duration::from_millis(delay_ms as u64)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts after the first
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// 0.0 = no jitter, 1.0 = full jitter
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &BreakerConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_backoff: config.base_backoff,
            max_backoff: config.max_backoff,
            jitter: config.retry_jitter,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Exponential delay before retry number `retry` (1-based), before jitter
    pub fn base_delay(&self, retry: u32) -> Duration {
        let base_ms = self.base_backoff.as_millis() as u64;
        let max_ms = self.max_backoff.as_millis() as u64;
        let factor = 2u64.saturating_pow(retry.saturating_sub(1));
        Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
    }

    /// Jittered delay before retry number `retry` (1-based)
    pub fn delay(&self, retry: u32) -> Duration {
        jittered(self.base_delay(retry), self.jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn policy(jitter: f64) -> RetryPolicy {
        RetryPolicy {
            max_retries: 5,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1_000),
            jitter,
        }
    }

    #[test]
    fn test_exponential_growth_without_jitter() {
        let retry = policy(0.0);
        assert_eq!(retry.delay(1), Duration::from_millis(100));
        assert_eq!(retry.delay(2), Duration::from_millis(200));
        assert_eq!(retry.delay(3), Duration::from_millis(400));
        assert_eq!(retry.delay(4), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_is_capped() {
        let retry = policy(0.0);
        assert_eq!(retry.delay(5), Duration::from_millis(1_000));
        assert_eq!(retry.delay(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_within_bounds() {
        let retry = policy(0.25);
        for _ in 0..50 {
            let delay = retry.delay(3);
            assert!(delay >= Duration::from_millis(299), "{:?} below bound", delay);
            assert!(delay <= Duration::from_millis(401), "{:?} above bound", delay);
        }
    }

    #[test]
    fn test_jitter_produces_variance() {
        let retry = policy(1.0);
        let values: HashSet<_> = (0..20).map(|_| retry.delay(4)).collect();
        assert!(
            values.len() >= 2,
            "Jitter should produce variance, got {} unique values",
            values.len()
        );
    }

    #[test]
    fn test_jittered_zero_factor_is_identity() {
        let d = Duration::from_millis(1_000);
        let values: HashSet<_> = (0..10).map(|_| jittered(d, 0.0)).collect();
        assert_eq!(values.len(), 1);
        assert!(values.contains(&d));
    }

    #[test]
    fn test_max_attempts_counts_first_try() {
        assert_eq!(policy(0.0).max_attempts(), 6);
    }
}
