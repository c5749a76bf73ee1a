//! In-memory message store for testing and embedding.
//!
//! Provides the full compare-and-transition contract without durability:
//! - Thread-safe concurrent access through a single `RwLock`
//! - Every transition happens inside one critical section, so a dropped
//!   caller can never observe or leave a partial update

use super::table::EntryTable;
use super::{MessageStore, StateCounts};
use crate::entry::{Entry, EntryId, EntryState, Expectation, Timestamp, Transition};
use crate::error::QueueError;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// In-memory message store implementation
#[derive(Clone)]
pub struct InMemoryMessageStore {
    table: Arc<RwLock<EntryTable>>,
}

impl InMemoryMessageStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            table: Arc::new(RwLock::new(EntryTable::new())),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, EntryTable>, QueueError> {
        self.table
            .read()
            .map_err(|_| QueueError::storage("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, EntryTable>, QueueError> {
        self.table
            .write()
            .map_err(|_| QueueError::storage("in-memory store lock poisoned"))
    }
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn insert(&self, payload: Bytes, now: Timestamp) -> Result<EntryId, QueueError> {
        let mut table = self.write()?;
        let id = table.allocate_id(now)?;
        table.commit(Entry::new(id, payload, now));
        Ok(id)
    }

    async fn fetch_oldest_visible(&self, now: Timestamp) -> Result<Option<Entry>, QueueError> {
        let table = self.read()?;
        Ok(table.oldest_visible(&now).cloned())
    }

    async fn compare_and_transition(
        &self,
        id: EntryId,
        expected: Expectation,
        transition: Transition,
    ) -> Result<Entry, QueueError> {
        let mut table = self.write()?;
        let next = table.prepare(id, &expected, &transition)?;
        table.commit(next.clone());
        Ok(next)
    }

    async fn get(&self, id: EntryId) -> Result<Option<Entry>, QueueError> {
        let table = self.read()?;
        Ok(table.get(&id).cloned())
    }

    async fn find_expired_leases(&self, now: Timestamp) -> Result<Vec<Entry>, QueueError> {
        let table = self.read()?;
        Ok(table.expired_leases(&now))
    }

    async fn list_by_state(&self, state: EntryState) -> Result<Vec<Entry>, QueueError> {
        let table = self.read()?;
        Ok(table.by_state(state))
    }

    async fn counts(&self) -> Result<StateCounts, QueueError> {
        let table = self.read()?;
        Ok(table.counts())
    }
}
