//! Time sources used for lease expiry and backoff scheduling.
//!
//! All queue components read time through [`Clock`] so tests can drive expiry
//! deterministically with [`ManualClock`].

use crate::entry::Timestamp;
use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

#[cfg(test)]
#[path = "clock_tests.rs"]
mod tests;

/// Provider of the current time
pub trait Clock: Send + Sync {
    /// Current time; successive calls never go backwards
    fn now(&self) -> Timestamp;
}

/// Wall clock that never reports a time earlier than one it already reported
///
/// System time can step backwards (NTP corrections); lease expiry comparisons
/// assume it cannot, so readings are clamped to the latest seen value.
#[derive(Debug, Default)]
pub struct SystemClock {
    last_micros: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let observed = Utc::now().timestamp_micros();
        let previous = self.last_micros.fetch_max(observed, Ordering::AcqRel);
        let micros = observed.max(previous);

        match DateTime::<Utc>::from_timestamp_micros(micros) {
            Some(dt) => Timestamp::from_datetime(dt),
            None => Timestamp::now(),
        }
    }
}

/// Convert a configured interval into a timer period of at least one millisecond
pub(crate) fn timer_period(duration: Duration) -> std::time::Duration {
    duration
        .to_std()
        .unwrap_or_default()
        .max(std::time::Duration::from_millis(1))
}

/// Manually advanced clock for tests and simulations
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Mutex::new(start.as_datetime()),
        }
    }

    /// Create a clock frozen at the current wall-clock time
    pub fn starting_now() -> Self {
        Self::new(Timestamp::now())
    }

    /// Move the clock forward; negative durations are ignored
    pub fn advance(&self, duration: Duration) {
        if duration <= Duration::zero() {
            return;
        }
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now = Timestamp::from_datetime(*now).add(duration).as_datetime();
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        let now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Timestamp::from_datetime(*now)
    }
}
