//! Persisted circuit state
//!
//! A `CircuitRecord` is the single unit of truth for one breaker key. It is
//! only ever replaced wholesale through the store's compare-and-swap, never
//! patched field by field.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Whether calls are allowed through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "Closed",
            CircuitState::Open => "Open",
            CircuitState::HalfOpen => "HalfOpen",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque compare-and-swap token assigned by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version(u64);

impl Version {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A record together with the version it was read at
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
    pub record: CircuitRecord,
    pub version: Version,
}

/// Shared state for one breaker key
///
/// All timestamps are milliseconds since the UNIX epoch so that every process
/// sharing the key interprets them the same way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitRecord {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub window_start: u64,
    pub window_successes: u64,
    pub window_failures: u64,
    /// Volume of the last complete window, used by throughput tracking
    #[serde(default)]
    pub baseline_volume: Option<u64>,
    pub opened_at: Option<u64>,
    pub open_until: Option<u64>,
    pub half_open_probe_claimed: bool,
    /// Lease on the probe slot; an expired lease may be claimed again
    #[serde(default)]
    pub probe_expires_at: Option<u64>,
}

impl CircuitRecord {
    /// Fresh `Closed` record with zeroed counters
    pub fn closed(now: u64) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            window_start: now,
            window_successes: 0,
            window_failures: 0,
            baseline_volume: None,
            opened_at: None,
            open_until: None,
            half_open_probe_claimed: false,
            probe_expires_at: None,
        }
    }

    /// Transition into `Open`, keeping the counters that led here
    ///
    /// `open_for` is clamped to at least one millisecond so `open_until` is
    /// always strictly in the future of `now`.
    pub fn opened(&self, now: u64, open_for: Duration) -> Self {
        let open_ms = (open_for.as_millis() as u64).max(1);
        Self {
            state: CircuitState::Open,
            opened_at: Some(now),
            open_until: Some(now.saturating_add(open_ms)),
            half_open_probe_claimed: false,
            probe_expires_at: None,
            ..self.clone()
        }
    }

    /// Transition into `HalfOpen` with the probe slot claimed by the writer
    pub fn probing(&self, now: u64, lease: Duration) -> Self {
        Self {
            state: CircuitState::HalfOpen,
            half_open_probe_claimed: true,
            probe_expires_at: Some(now.saturating_add(lease.as_millis() as u64)),
            ..self.clone()
        }
    }

    /// Open period has elapsed
    pub fn open_expired(&self, now: u64) -> bool {
        match self.open_until {
            Some(until) => now >= until,
            None => true,
        }
    }

    /// A probe holds the half-open slot and its lease is still valid
    pub fn probe_in_flight(&self, now: u64) -> bool {
        self.half_open_probe_claimed && self.probe_expires_at.is_none_or(|expires| now < expires)
    }

    /// Time left until `open_until`, if any
    pub fn retry_after(&self, now: u64) -> Option<Duration> {
        self.open_until
            .map(|until| Duration::from_millis(until.saturating_sub(now)))
    }

    pub fn window_volume(&self) -> u64 {
        self.window_successes + self.window_failures
    }

    /// Failure ratio in the current window, 0.0 when empty
    pub fn window_error_rate(&self) -> f64 {
        let total = self.window_volume();
        if total == 0 {
            0.0
        } else {
            self.window_failures as f64 / total as f64
        }
    }

    /// Reset the window when `now` is past `window_start + sampling`
    ///
    /// The finished window's volume becomes the baseline when exactly one
    /// window elapsed. After a longer gap the previous baseline is kept since
    /// empty windows carry no evidence about normal volume.
    pub fn roll_window(&mut self, now: u64, sampling: Duration) {
        let sampling_ms = (sampling.as_millis() as u64).max(1);
        let elapsed = now.saturating_sub(self.window_start);
        if elapsed <= sampling_ms {
            return;
        }

        if elapsed <= sampling_ms.saturating_mul(2) {
            self.baseline_volume = Some(self.window_volume());
        }
        self.window_start = now;
        self.window_successes = 0;
        self.window_failures = 0;
    }
}
