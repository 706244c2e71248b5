//! Trip strategies
//!
//! Each strategy is one variant of `BreakerPolicy` with a single `decide`
//! step. Policies only update counter fields; the state machine in
//! `circuit` owns `state`, `opened_at`, `open_until` and the probe slot.

use crate::classifier::Verdict;
use crate::record::CircuitRecord;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Outcome of feeding one verdict to a policy
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Keep the current state, persisting the updated counters
    Remain(CircuitRecord),
    /// Open the circuit; the record carries the counters that tripped it
    Open(CircuitRecord),
}

impl Transition {
    pub fn into_record(self) -> CircuitRecord {
        match self {
            Transition::Remain(r) | Transition::Open(r) => r,
        }
    }

    pub fn opens(&self) -> bool {
        matches!(self, Transition::Open(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BreakerPolicy {
    /// Open after `failure_threshold` failures in a row
    ///
    /// Ignores volume: an isolated burst of exactly `failure_threshold`
    /// failures under light traffic opens the circuit even when the
    /// dependency is otherwise healthy.
    ConsecutiveFailure { failure_threshold: u32 },

    /// Open when the failure ratio in a fixed window reaches the threshold
    ///
    /// Windows reset wholesale once `sampling_duration` has passed; prior
    /// evidence is discarded rather than averaged.
    ErrorRate {
        error_rate_threshold: f64,
        minimum_throughput: u64,
        #[serde(with = "humantime_serde")]
        sampling_duration: Duration,
    },

    /// Open when volume has dropped against the trailing baseline and the
    /// remaining calls are failing
    ///
    /// Catches degradation that throttles traffic (latency, queueing) before
    /// it shows up as a flood of errors.
    ThroughputBased {
        volume_drop_percent: f64,
        error_rate_threshold: f64,
        #[serde(with = "humantime_serde")]
        sampling_duration: Duration,
    },
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        BreakerPolicy::ConsecutiveFailure {
            failure_threshold: 5,
        }
    }
}

impl BreakerPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            BreakerPolicy::ConsecutiveFailure { .. } => "consecutive_failure",
            BreakerPolicy::ErrorRate { .. } => "error_rate",
            BreakerPolicy::ThroughputBased { .. } => "throughput_based",
        }
    }

    /// Fold one verdict into `record` (a `Closed` record) and decide whether
    /// to open
    pub fn decide(&self, record: &CircuitRecord, verdict: Verdict, now: u64) -> Transition {
        let mut next = record.clone();

        match *self {
            BreakerPolicy::ConsecutiveFailure { failure_threshold } => {
                count_consecutive(&mut next, verdict);
                if next.consecutive_failures >= failure_threshold {
                    Transition::Open(next)
                } else {
                    Transition::Remain(next)
                }
            }

            BreakerPolicy::ErrorRate {
                error_rate_threshold,
                minimum_throughput,
                sampling_duration,
            } => {
                next.roll_window(now, sampling_duration);
                count_consecutive(&mut next, verdict);
                count_window(&mut next, verdict);

                if next.window_volume() < minimum_throughput {
                    return Transition::Remain(next);
                }
                if next.window_error_rate() >= error_rate_threshold {
                    Transition::Open(next)
                } else {
                    Transition::Remain(next)
                }
            }

            BreakerPolicy::ThroughputBased {
                volume_drop_percent,
                error_rate_threshold,
                sampling_duration,
            } => {
                next.roll_window(now, sampling_duration);
                count_consecutive(&mut next, verdict);
                count_window(&mut next, verdict);

                let dropped = volume_drop(&next, now, sampling_duration)
                    .is_some_and(|drop| drop >= volume_drop_percent);
                if dropped && next.window_error_rate() > error_rate_threshold {
                    Transition::Open(next)
                } else {
                    Transition::Remain(next)
                }
            }
        }
    }
}

fn count_consecutive(record: &mut CircuitRecord, verdict: Verdict) {
    match verdict {
        Verdict::Success => record.consecutive_failures = 0,
        Verdict::Failure => {
            record.consecutive_failures = record.consecutive_failures.saturating_add(1)
        }
    }
}

fn count_window(record: &mut CircuitRecord, verdict: Verdict) {
    match verdict {
        Verdict::Success => record.window_successes = record.window_successes.saturating_add(1),
        Verdict::Failure => record.window_failures = record.window_failures.saturating_add(1),
    }
}

/// Percentage by which the current window trails the baseline, prorated by
/// how much of the window has elapsed
///
/// `None` while there is no baseline to compare against.
fn volume_drop(record: &CircuitRecord, now: u64, sampling: Duration) -> Option<f64> {
    let baseline = record.baseline_volume.filter(|b| *b > 0)? as f64;
    let sampling_ms = (sampling.as_millis() as u64).max(1) as f64;
    let elapsed_ms = now.saturating_sub(record.window_start) as f64;
    let fraction = (elapsed_ms / sampling_ms).clamp(0.0, 1.0);

    let expected = baseline * fraction;
    if expected <= 0.0 {
        return None;
    }

    let current = record.window_volume() as f64;
    Some(((expected - current) / expected * 100.0).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(policy: &BreakerPolicy, record: &mut CircuitRecord, verdicts: &[Verdict], now: u64) -> bool {
        let mut opened = false;
        for verdict in verdicts {
            let transition = policy.decide(record, *verdict, now);
            opened = transition.opens();
            *record = transition.into_record();
        }
        opened
    }

    #[test]
    fn test_consecutive_failure_opens_at_threshold() {
        let policy = BreakerPolicy::ConsecutiveFailure {
            failure_threshold: 3,
        };
        let mut record = CircuitRecord::closed(0);

        assert!(!feed(&policy, &mut record, &[Verdict::Failure, Verdict::Failure], 0));
        assert_eq!(record.consecutive_failures, 2);
        assert!(feed(&policy, &mut record, &[Verdict::Failure], 0));
    }

    #[test]
    fn test_consecutive_failure_success_resets() {
        let policy = BreakerPolicy::ConsecutiveFailure {
            failure_threshold: 3,
        };
        let mut record = CircuitRecord::closed(0);

        let opened = feed(
            &policy,
            &mut record,
            &[Verdict::Failure, Verdict::Failure, Verdict::Success],
            0,
        );
        assert!(!opened);
        assert_eq!(record.consecutive_failures, 0);
    }

    #[test]
    fn test_error_rate_respects_minimum_throughput() {
        let policy = BreakerPolicy::ErrorRate {
            error_rate_threshold: 0.5,
            minimum_throughput: 20,
            sampling_duration: Duration::from_secs(60),
        };
        let mut record = CircuitRecord::closed(0);

        // 100% failure rate but only 10 calls
        assert!(!feed(&policy, &mut record, &[Verdict::Failure; 10], 1_000));
        assert_eq!(record.window_failures, 10);

        assert!(!feed(&policy, &mut record, &[Verdict::Success; 9], 1_000));
        assert_eq!(record.window_volume(), 19);

        // 20th call reaches the floor with 11/20 failing
        assert!(feed(&policy, &mut record, &[Verdict::Failure], 1_000));
    }

    #[test]
    fn test_error_rate_below_threshold_stays_closed() {
        let policy = BreakerPolicy::ErrorRate {
            error_rate_threshold: 0.5,
            minimum_throughput: 4,
            sampling_duration: Duration::from_secs(60),
        };
        let mut record = CircuitRecord::closed(0);

        let verdicts = [
            Verdict::Success,
            Verdict::Failure,
            Verdict::Success,
            Verdict::Success,
            Verdict::Failure,
            Verdict::Success,
        ];
        assert!(!feed(&policy, &mut record, &verdicts, 10));
    }

    #[test]
    fn test_error_rate_window_rollover_discards_evidence() {
        let policy = BreakerPolicy::ErrorRate {
            error_rate_threshold: 0.5,
            minimum_throughput: 5,
            sampling_duration: Duration::from_secs(1),
        };
        let mut record = CircuitRecord::closed(0);

        assert!(!feed(&policy, &mut record, &[Verdict::Failure; 4], 500));
        // Next window starts fresh: one failure is below the floor again
        assert!(!feed(&policy, &mut record, &[Verdict::Failure], 1_600));
        assert_eq!(record.window_failures, 1);
        assert_eq!(record.window_start, 1_600);
    }

    #[test]
    fn test_throughput_based_needs_baseline() {
        let policy = BreakerPolicy::ThroughputBased {
            volume_drop_percent: 50.0,
            error_rate_threshold: 0.2,
            sampling_duration: Duration::from_secs(10),
        };
        let mut record = CircuitRecord::closed(0);

        assert!(!feed(&policy, &mut record, &[Verdict::Failure; 5], 9_000));
    }

    #[test]
    fn test_throughput_based_opens_on_drop_with_errors() {
        let policy = BreakerPolicy::ThroughputBased {
            volume_drop_percent: 50.0,
            error_rate_threshold: 0.2,
            sampling_duration: Duration::from_secs(10),
        };
        let mut record = CircuitRecord::closed(0);
        record.baseline_volume = Some(100);

        // 9s into the window only 5 calls arrived where ~90 were expected,
        // and 2 of them failed
        let verdicts = [
            Verdict::Success,
            Verdict::Success,
            Verdict::Success,
            Verdict::Failure,
            Verdict::Failure,
        ];
        assert!(feed(&policy, &mut record, &verdicts, 9_000));
    }

    #[test]
    fn test_throughput_based_ignores_drop_without_errors() {
        let policy = BreakerPolicy::ThroughputBased {
            volume_drop_percent: 50.0,
            error_rate_threshold: 0.2,
            sampling_duration: Duration::from_secs(10),
        };
        let mut record = CircuitRecord::closed(0);
        record.baseline_volume = Some(100);

        assert!(!feed(&policy, &mut record, &[Verdict::Success; 5], 9_000));
    }

    #[test]
    fn test_throughput_based_ignores_errors_at_normal_volume() {
        let policy = BreakerPolicy::ThroughputBased {
            volume_drop_percent: 50.0,
            error_rate_threshold: 0.2,
            sampling_duration: Duration::from_secs(10),
        };
        let mut record = CircuitRecord::closed(0);
        record.baseline_volume = Some(10);
        record.window_successes = 6;

        // Half way through with 8 calls against 5 expected: no drop
        assert!(!feed(&policy, &mut record, &[Verdict::Failure, Verdict::Failure], 5_000));
    }

    #[test]
    fn test_policy_serde_tagging() {
        let json = r#"{"strategy":"error_rate","error_rate_threshold":0.5,"minimum_throughput":20,"sampling_duration":"30s"}"#;
        let policy: BreakerPolicy = serde_json::from_str(json).unwrap();
        assert_eq!(
            policy,
            BreakerPolicy::ErrorRate {
                error_rate_threshold: 0.5,
                minimum_throughput: 20,
                sampling_duration: Duration::from_secs(30),
            }
        );
        assert_eq!(policy.name(), "error_rate");
    }
}
