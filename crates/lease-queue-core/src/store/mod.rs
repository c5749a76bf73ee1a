//! Durable storage of queue entries.
//!
//! [`MessageStore`] owns the authoritative copy of every entry. All state
//! changes go through [`MessageStore::compare_and_transition`], which is atomic
//! with respect to every other caller of the same store.

mod file;
mod memory;
mod table;

pub use file::FileMessageStore;
pub use memory::InMemoryMessageStore;

use crate::config::StorageConfig;
use crate::entry::{Entry, EntryId, EntryState, Timestamp, Transition};
use crate::error::QueueError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Number of live entries per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub visible: usize,
    pub leased: usize,
    pub quarantined: usize,
}

impl StateCounts {
    pub fn total(&self) -> usize {
        self.visible + self.leased + self.quarantined
    }
}

/// Storage backend for queue entries
///
/// Every operation that cannot reach its storage reports
/// [`QueueError::StorageUnavailable`]; implementations never retry internally.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a new `Visible` entry enqueued at `now` and return its id
    async fn insert(&self, payload: Bytes, now: Timestamp) -> Result<EntryId, QueueError>;

    /// Oldest entry (by enqueue time, then id) that is `Visible` and whose
    /// backoff has elapsed at `now`
    async fn fetch_oldest_visible(&self, now: Timestamp) -> Result<Option<Entry>, QueueError>;

    /// Atomically apply `transition` if the entry still matches `expected`
    ///
    /// Returns the entry as it looks after the transition. Fails with
    /// [`QueueError::Conflict`] when state or lease token differ from the
    /// expectation and [`QueueError::NotFound`] for unknown or deleted ids.
    ///
    /// Spelled out by path so the generated mock's own `Expectation` type
    /// does not shadow it.
    async fn compare_and_transition(
        &self,
        id: EntryId,
        expected: crate::entry::Expectation,
        transition: Transition,
    ) -> Result<Entry, QueueError>;

    /// Point lookup; deleted entries are never returned
    async fn get(&self, id: EntryId) -> Result<Option<Entry>, QueueError>;

    /// Leased entries whose lease expired at or before `now`
    async fn find_expired_leases(&self, now: Timestamp) -> Result<Vec<Entry>, QueueError>;

    /// All entries in `state`, oldest first
    async fn list_by_state(&self, state: EntryState) -> Result<Vec<Entry>, QueueError>;

    /// Number of live entries per state
    async fn counts(&self) -> Result<StateCounts, QueueError>;
}

/// Build the store described by `config`
pub async fn open_store(config: &StorageConfig) -> Result<Arc<dyn MessageStore>, QueueError> {
    match config {
        StorageConfig::InMemory => Ok(Arc::new(InMemoryMessageStore::new())),
        StorageConfig::Filesystem { path } => {
            let store = FileMessageStore::open(path.clone()).await?;
            Ok(Arc::new(store))
        }
    }
}
