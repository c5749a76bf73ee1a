//! In-memory entry table shared by the store implementations.

use super::StateCounts;
use crate::entry::{Entry, EntryId, EntryState, Expectation, Timestamp, Transition};
use crate::error::QueueError;
use std::collections::{BTreeSet, HashMap};
use std::time::SystemTime;
use ulid::{Generator, Ulid};

#[cfg(test)]
#[path = "table_tests.rs"]
mod tests;

/// Entries plus indexes of the visible ones in fetch order and the leased
/// ones in expiry order
///
/// Deleted entries are removed outright; the table never holds a record in the
/// `Deleted` state.
pub(crate) struct EntryTable {
    entries: HashMap<EntryId, Entry>,
    /// `(enqueued_at, id)` of every `Visible` entry
    visible: BTreeSet<(Timestamp, EntryId)>,
    /// `(lease_expires_at, id)` of every `Leased` entry
    leases: BTreeSet<(Timestamp, EntryId)>,
    ids: Generator,
    /// Largest id ever held, including ids loaded from disk
    highest_id: Option<Ulid>,
}

impl EntryTable {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
            visible: BTreeSet::new(),
            leases: BTreeSet::new(),
            ids: Generator::new(),
            highest_id: None,
        }
    }

    /// Rebuild a table from previously persisted entries
    pub(crate) fn from_entries(entries: impl IntoIterator<Item = Entry>) -> Self {
        let mut table = Self::new();
        for entry in entries {
            table.commit(entry);
        }
        table
    }

    /// Allocate an id that sorts after every id this table has held, including
    /// those of entries loaded from an earlier run
    pub(crate) fn allocate_id(&mut self, now: Timestamp) -> Result<EntryId, QueueError> {
        let when: SystemTime = now.as_datetime().into();
        let generated = self
            .ids
            .generate_from_datetime(when)
            .map_err(|e| QueueError::storage(format!("id generation failed: {}", e)))?;

        let ulid = match self.highest_id {
            Some(highest) if generated <= highest => highest
                .increment()
                .ok_or_else(|| QueueError::storage("entry id space exhausted"))?,
            _ => generated,
        };

        self.highest_id = Some(ulid);
        Ok(EntryId::from_ulid(ulid))
    }

    pub(crate) fn get(&self, id: &EntryId) -> Option<&Entry> {
        self.entries.get(id)
    }

    pub(crate) fn oldest_visible(&self, now: &Timestamp) -> Option<&Entry> {
        self.visible
            .iter()
            .filter_map(|(_, id)| self.entries.get(id))
            .find(|entry| entry.is_available(now))
    }

    /// Compute the result of a conditional transition without applying it
    pub(crate) fn prepare(
        &self,
        id: EntryId,
        expected: &Expectation,
        transition: &Transition,
    ) -> Result<Entry, QueueError> {
        let current = self
            .entries
            .get(&id)
            .ok_or(QueueError::NotFound { entry_id: id })?;

        if !expected.matches(current) {
            return Err(QueueError::Conflict {
                entry_id: id,
                expected: expected.state,
                actual: current.state(),
            });
        }

        Ok(current.apply(transition))
    }

    /// Store `entry` as the current version of its record
    pub(crate) fn commit(&mut self, entry: Entry) {
        let id = entry.id();
        self.highest_id = self.highest_id.max(Some(id.as_ulid()));

        if let Some(previous) = self.entries.get(&id) {
            match (previous.state(), previous.lease_expires_at()) {
                (EntryState::Visible, _) => {
                    self.visible.remove(&(previous.enqueued_at(), id));
                }
                (EntryState::Leased, Some(expires_at)) => {
                    self.leases.remove(&(expires_at, id));
                }
                _ => {}
            }
        }

        if entry.state().is_terminal() {
            self.entries.remove(&id);
            return;
        }

        match (entry.state(), entry.lease_expires_at()) {
            (EntryState::Visible, _) => {
                self.visible.insert((entry.enqueued_at(), id));
            }
            (EntryState::Leased, Some(expires_at)) => {
                self.leases.insert((expires_at, id));
            }
            _ => {}
        }
        self.entries.insert(id, entry);
    }

    /// Leased entries whose lease ran out at or before `now`, earliest expiry
    /// first
    pub(crate) fn expired_leases(&self, now: &Timestamp) -> Vec<Entry> {
        self.leases
            .iter()
            .take_while(|(expires_at, _)| expires_at <= now)
            .filter_map(|(_, id)| self.entries.get(id))
            .cloned()
            .collect()
    }

    pub(crate) fn by_state(&self, state: EntryState) -> Vec<Entry> {
        let mut matching: Vec<Entry> = self
            .entries
            .values()
            .filter(|entry| entry.state() == state)
            .cloned()
            .collect();
        matching.sort_by_key(|entry| (entry.enqueued_at(), entry.id()));
        matching
    }

    pub(crate) fn counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for entry in self.entries.values() {
            match entry.state() {
                EntryState::Visible => counts.visible += 1,
                EntryState::Leased => counts.leased += 1,
                EntryState::Quarantined => counts.quarantined += 1,
                EntryState::Deleted => {}
            }
        }
        counts
    }
}
