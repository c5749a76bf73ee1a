//! Error types for queue operations.

use crate::entry::{EntryId, EntryState, Timestamp};
use chrono::Duration;
use thiserror::Error;

/// Comprehensive error type for all queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Storage unavailable: {message}")]
    StorageUnavailable { message: String },

    #[error("Entry {entry_id} is {actual}, expected {expected}")]
    Conflict {
        entry_id: EntryId,
        expected: EntryState,
        actual: EntryState,
    },

    #[error("Lease token is not valid for entry {entry_id}")]
    InvalidToken { entry_id: EntryId },

    #[error("Lease on entry {entry_id} expired at {expired_at}")]
    LeaseExpired {
        entry_id: EntryId,
        expired_at: Timestamp,
    },

    #[error("Dequeue gave up after {attempts} contended attempts")]
    Busy { attempts: u32 },

    #[error("Entry not found: {entry_id}")]
    NotFound { entry_id: EntryId },

    #[error("Payload too large: {size} bytes (max: {max_size})")]
    PayloadTooLarge { size: usize, max_size: usize },

    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    ValidationError(#[from] ValidationError),
}

impl QueueError {
    /// Wrap a storage-layer failure
    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageUnavailable {
            message: message.into(),
        }
    }

    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::StorageUnavailable { .. } => true,
            Self::Conflict { .. } => true,
            Self::InvalidToken { .. } => false,
            Self::LeaseExpired { .. } => false,
            Self::Busy { .. } => true,
            Self::NotFound { .. } => false,
            Self::PayloadTooLarge { .. } => false,
            Self::ConfigurationError(_) => false,
            Self::ValidationError(_) => false,
        }
    }

    /// Check if the caller has lost ownership of the leased work
    pub fn is_lost_lease(&self) -> bool {
        matches!(self, Self::InvalidToken { .. } | Self::LeaseExpired { .. })
    }

    /// Get suggested retry delay
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::StorageUnavailable { .. } => Some(Duration::seconds(1)),
            Self::Busy { .. } => Some(Duration::milliseconds(100)),
            Self::Conflict { .. } => Some(Duration::zero()),
            _ => None,
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
