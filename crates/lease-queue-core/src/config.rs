//! Queue and worker configuration.
//!
//! Durations are carried as whole milliseconds so the structures load cleanly
//! from YAML files and environment variables. Call `validate()` before handing a
//! configuration to [`crate::QueueService`] or [`crate::Worker`].

use crate::error::ConfigurationError;
use crate::retry::RetryPolicy;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// Convert a millisecond setting into a duration, saturating at the maximum
fn millis(value: u64) -> Duration {
    i64::try_from(value)
        .ok()
        .and_then(Duration::try_milliseconds)
        .unwrap_or(Duration::MAX)
}

fn require_positive(field: &str, value: u64) -> Result<(), ConfigurationError> {
    if value == 0 {
        return Err(ConfigurationError::Invalid {
            message: format!("{} must be greater than zero", field),
        });
    }
    Ok(())
}

// ============================================================================
// Queue Configuration
// ============================================================================

/// Configuration for the queue service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Deliveries allowed before an entry is quarantined
    pub max_delivery_attempts: u32,

    /// Backoff after the first failed delivery, in milliseconds
    pub base_delay_ms: u64,

    /// Ceiling for any backoff, in milliseconds
    pub max_backoff_ms: u64,

    /// Lease length used when a consumer does not pick one, in milliseconds
    pub default_lease_duration_ms: u64,

    /// Contended fetch/grant rounds before dequeue reports `Busy`
    pub max_dequeue_attempts: u32,

    /// Largest accepted payload in bytes
    pub max_payload_bytes: usize,

    /// Period of the background expired-lease sweep, in milliseconds
    pub reap_interval_ms: u64,

    /// Storage backend
    pub storage: StorageConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_delivery_attempts: 5,
            base_delay_ms: 1_000,
            max_backoff_ms: 60_000,
            default_lease_duration_ms: 30_000,
            max_dequeue_attempts: 16,
            max_payload_bytes: 64 * 1024, // 64KB
            reap_interval_ms: 1_000,
            storage: StorageConfig::default(),
        }
    }
}

impl QueueConfig {
    /// Check the settings for values the queue cannot operate with
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_delivery_attempts == 0 {
            return Err(ConfigurationError::Invalid {
                message: "max_delivery_attempts must be at least 1".to_string(),
            });
        }

        if self.max_dequeue_attempts == 0 {
            return Err(ConfigurationError::Invalid {
                message: "max_dequeue_attempts must be at least 1".to_string(),
            });
        }

        if self.base_delay_ms > self.max_backoff_ms {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "base_delay_ms ({}) must not exceed max_backoff_ms ({})",
                    self.base_delay_ms, self.max_backoff_ms
                ),
            });
        }

        require_positive("default_lease_duration_ms", self.default_lease_duration_ms)?;
        require_positive("reap_interval_ms", self.reap_interval_ms)?;

        if self.max_payload_bytes == 0 {
            return Err(ConfigurationError::Invalid {
                message: "max_payload_bytes must be greater than zero".to_string(),
            });
        }

        self.storage.validate()
    }

    pub fn base_delay(&self) -> Duration {
        millis(self.base_delay_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        millis(self.max_backoff_ms)
    }

    pub fn default_lease_duration(&self) -> Duration {
        millis(self.default_lease_duration_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        millis(self.reap_interval_ms)
    }

    /// Retry policy described by these settings
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_delivery_attempts,
            self.base_delay(),
            self.max_backoff(),
        )
    }
}

/// Storage backend selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Entries live only as long as the process
    #[default]
    InMemory,

    /// Entries are persisted as JSON records under `path`
    Filesystem { path: PathBuf },
}

impl StorageConfig {
    fn validate(&self) -> Result<(), ConfigurationError> {
        match self {
            Self::InMemory => Ok(()),
            Self::Filesystem { path } if path.as_os_str().is_empty() => {
                Err(ConfigurationError::Missing {
                    key: "storage.path".to_string(),
                })
            }
            Self::Filesystem { .. } => Ok(()),
        }
    }
}

// ============================================================================
// Worker Configuration
// ============================================================================

/// Configuration for a consuming worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Lease requested for each task, in milliseconds
    pub lease_duration_ms: u64,

    /// Wait between dequeue attempts when the queue is empty, in milliseconds
    pub poll_interval_ms: u64,

    /// Period of lease extensions while a task runs, in milliseconds
    pub heartbeat_interval_ms: u64,

    /// Stop after this many tasks have been handled
    pub max_tasks: Option<u64>,

    /// Stop as soon as the queue has nothing visible
    pub stop_when_empty: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            lease_duration_ms: 30_000,
            poll_interval_ms: 500,
            heartbeat_interval_ms: 10_000,
            max_tasks: None,
            stop_when_empty: false,
        }
    }
}

impl WorkerConfig {
    /// Check that intervals are positive and heartbeats beat the lease expiry
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        require_positive("lease_duration_ms", self.lease_duration_ms)?;
        require_positive("poll_interval_ms", self.poll_interval_ms)?;
        require_positive("heartbeat_interval_ms", self.heartbeat_interval_ms)?;

        if self.heartbeat_interval_ms >= self.lease_duration_ms {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "heartbeat_interval_ms ({}) must be shorter than lease_duration_ms ({})",
                    self.heartbeat_interval_ms, self.lease_duration_ms
                ),
            });
        }

        Ok(())
    }

    pub fn lease_duration(&self) -> Duration {
        millis(self.lease_duration_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        millis(self.heartbeat_interval_ms)
    }
}
