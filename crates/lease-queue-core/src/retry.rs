//! # Retry Policy Module
//!
//! Decides what happens to an entry whose work failed or whose lease ran out:
//! re-offer it after an exponential backoff, or quarantine it once it has been
//! delivered too many times.

use crate::entry::Entry;
use chrono::Duration;

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;

/// Fate of an entry after a failed delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Make the entry visible again after `delay`
    Requeue { delay: Duration },

    /// Stop circulating the entry until an operator intervenes
    Quarantine,
}

/// Retry policy configuration for exponential backoff
///
/// # Examples
///
/// ```rust
/// use lease_queue_core::retry::RetryPolicy;
/// use chrono::Duration;
///
/// // Default policy: 5 deliveries, 1s base delay, 60s ceiling
/// let policy = RetryPolicy::default();
///
/// // Custom policy
/// let policy = RetryPolicy::new(3, Duration::milliseconds(500), Duration::seconds(5));
/// assert_eq!(policy.max_delivery_attempts, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Deliveries allowed before an entry is quarantined
    pub max_delivery_attempts: u32,

    /// Delay after the first failed delivery
    pub base_delay: Duration,

    /// Ceiling applied to every computed delay
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_delivery_attempts: 5,
            base_delay: Duration::seconds(1),
            max_backoff: Duration::seconds(60),
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy
    ///
    /// # Arguments
    ///
    /// * `max_delivery_attempts` - Deliveries allowed before quarantine
    /// * `base_delay` - Delay after the first failed delivery
    /// * `max_backoff` - Maximum delay cap
    pub fn new(max_delivery_attempts: u32, base_delay: Duration, max_backoff: Duration) -> Self {
        Self {
            max_delivery_attempts,
            base_delay,
            max_backoff,
        }
    }

    /// Calculate the backoff for an entry that has been delivered `delivery_count` times
    ///
    /// Uses `base_delay * 2^(delivery_count - 1)`, capped at `max_backoff`.
    /// Overflow saturates to the cap, so the sequence is non-decreasing.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use lease_queue_core::retry::RetryPolicy;
    /// use chrono::Duration;
    ///
    /// let policy = RetryPolicy::new(5, Duration::seconds(1), Duration::seconds(10));
    ///
    /// assert_eq!(policy.backoff_delay(1), Duration::seconds(1));
    /// assert_eq!(policy.backoff_delay(3), Duration::seconds(4));
    /// assert_eq!(policy.backoff_delay(5), Duration::seconds(10));
    /// ```
    pub fn backoff_delay(&self, delivery_count: u32) -> Duration {
        let cap_ms = self.max_backoff.num_milliseconds().max(0);
        let base_ms = self.base_delay.num_milliseconds().clamp(0, cap_ms);

        let exponent = delivery_count.saturating_sub(1);
        let delay_ms = if exponent >= 63 {
            if base_ms == 0 {
                0
            } else {
                cap_ms
            }
        } else {
            base_ms.saturating_mul(1_i64 << exponent).min(cap_ms)
        };

        Duration::milliseconds(delay_ms)
    }

    /// Check if an entry delivered `delivery_count` times may be offered again
    pub fn should_retry(&self, delivery_count: u32) -> bool {
        delivery_count < self.max_delivery_attempts
    }

    /// Decide the fate of an entry whose delivery failed or whose lease expired
    pub fn on_failure(&self, entry: &Entry) -> RetryAction {
        let delivery_count = entry.delivery_count();
        if self.should_retry(delivery_count) {
            RetryAction::Requeue {
                delay: self.backoff_delay(delivery_count),
            }
        } else {
            RetryAction::Quarantine
        }
    }
}
