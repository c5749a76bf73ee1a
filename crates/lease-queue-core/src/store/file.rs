//! File-backed message store.
//!
//! Layout: one JSON record per live entry at `<root>/entries/<id>.json`.
//! Records are replaced by writing `<id>.json.tmp`, syncing it and renaming it
//! over the old record, so a crash leaves either the old or the new version.
//! Deleting an entry removes its record. The entries directory is synced after
//! every rename and removal so the change to the directory itself is durable.
//!
//! All records are loaded into an [`EntryTable`] on open. Every operation runs
//! on a blocking task that holds the table lock for the whole
//! prepare/persist/commit sequence; dropping the calling future does not stop
//! that task, so the table and the disk always agree.

use super::table::EntryTable;
use super::{MessageStore, StateCounts};
use crate::entry::{Entry, EntryId, EntryState, Expectation, Timestamp, Transition};
use crate::error::QueueError;
use async_trait::async_trait;
use bytes::Bytes;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "file_tests.rs"]
mod tests;

const ENTRIES_DIR: &str = "entries";
const RECORD_EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "tmp";

/// Durable message store rooted at a directory
#[derive(Clone)]
pub struct FileMessageStore {
    inner: Arc<Inner>,
}

struct Inner {
    entries_dir: PathBuf,
    table: Mutex<EntryTable>,
}

impl FileMessageStore {
    /// Open (or create) the store rooted at `root` and load every record
    pub async fn open(root: PathBuf) -> Result<Self, QueueError> {
        let inner = tokio::task::spawn_blocking(move || Inner::load(&root))
            .await
            .map_err(|e| QueueError::storage(format!("store open task failed: {}", e)))??;

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Directory holding the entry records
    pub fn entries_dir(&self) -> &Path {
        &self.inner.entries_dir
    }

    async fn run<T, F>(&self, operation: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T, QueueError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || operation(&inner))
            .await
            .map_err(|e| QueueError::storage(format!("store task failed: {}", e)))?
    }
}

impl Inner {
    fn load(root: &Path) -> Result<Self, QueueError> {
        let entries_dir = root.join(ENTRIES_DIR);
        fs::create_dir_all(&entries_dir).map_err(|e| io_error("create", &entries_dir, e))?;

        let mut entries = Vec::new();
        let listing = fs::read_dir(&entries_dir).map_err(|e| io_error("list", &entries_dir, e))?;
        for item in listing {
            let path = item.map_err(|e| io_error("list", &entries_dir, e))?.path();
            match path.extension().and_then(|ext| ext.to_str()) {
                Some(TEMP_EXTENSION) => {
                    warn!(path = %path.display(), "Discarding incomplete record write");
                    fs::remove_file(&path).map_err(|e| io_error("remove", &path, e))?;
                }
                Some(RECORD_EXTENSION) => entries.push(read_record(&path)?),
                _ => debug!(path = %path.display(), "Ignoring unrelated file in store"),
            }
        }

        info!(
            path = %entries_dir.display(),
            entries = entries.len(),
            "Opened file message store"
        );

        Ok(Self {
            entries_dir,
            table: Mutex::new(EntryTable::from_entries(entries)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, EntryTable>, QueueError> {
        self.table
            .lock()
            .map_err(|_| QueueError::storage("file store lock poisoned"))
    }

    fn record_path(&self, id: EntryId) -> PathBuf {
        self.entries_dir.join(format!("{}.{}", id, RECORD_EXTENSION))
    }

    /// Make the on-disk record match `entry`
    fn persist(&self, entry: &Entry) -> Result<(), QueueError> {
        let path = self.record_path(entry.id());

        if entry.state().is_terminal() {
            return match fs::remove_file(&path) {
                Ok(()) => self.sync_dir(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(io_error("remove", &path, e)),
            };
        }

        let body = serde_json::to_vec_pretty(entry)
            .map_err(|e| QueueError::storage(format!("failed to encode entry {}: {}", entry.id(), e)))?;

        let temp = path.with_extension(format!("{}.{}", RECORD_EXTENSION, TEMP_EXTENSION));
        let mut file = fs::File::create(&temp).map_err(|e| io_error("create", &temp, e))?;
        file.write_all(&body).map_err(|e| io_error("write", &temp, e))?;
        file.sync_all().map_err(|e| io_error("sync", &temp, e))?;
        drop(file);

        fs::rename(&temp, &path).map_err(|e| io_error("rename", &temp, e))?;
        self.sync_dir()
    }

    /// Flush the directory entry changes made by a rename or removal
    #[cfg(unix)]
    fn sync_dir(&self) -> Result<(), QueueError> {
        fs::File::open(&self.entries_dir)
            .and_then(|dir| dir.sync_all())
            .map_err(|e| io_error("sync", &self.entries_dir, e))
    }

    /// Directories cannot be opened for syncing on this platform
    #[cfg(not(unix))]
    fn sync_dir(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

fn read_record(path: &Path) -> Result<Entry, QueueError> {
    let body = fs::read(path).map_err(|e| io_error("read", path, e))?;
    serde_json::from_slice(&body).map_err(|e| {
        QueueError::storage(format!("corrupt entry record {}: {}", path.display(), e))
    })
}

fn io_error(action: &str, path: &Path, error: io::Error) -> QueueError {
    QueueError::storage(format!("failed to {} {}: {}", action, path.display(), error))
}

#[async_trait]
impl MessageStore for FileMessageStore {
    async fn insert(&self, payload: Bytes, now: Timestamp) -> Result<EntryId, QueueError> {
        self.run(move |inner| {
            let mut table = inner.lock()?;
            let id = table.allocate_id(now)?;
            let entry = Entry::new(id, payload, now);
            inner.persist(&entry)?;
            table.commit(entry);
            Ok(id)
        })
        .await
    }

    async fn fetch_oldest_visible(&self, now: Timestamp) -> Result<Option<Entry>, QueueError> {
        self.run(move |inner| Ok(inner.lock()?.oldest_visible(&now).cloned()))
            .await
    }

    async fn compare_and_transition(
        &self,
        id: EntryId,
        expected: Expectation,
        transition: Transition,
    ) -> Result<Entry, QueueError> {
        self.run(move |inner| {
            let mut table = inner.lock()?;
            let next = table.prepare(id, &expected, &transition)?;
            inner.persist(&next)?;
            table.commit(next.clone());
            Ok(next)
        })
        .await
    }

    async fn get(&self, id: EntryId) -> Result<Option<Entry>, QueueError> {
        self.run(move |inner| Ok(inner.lock()?.get(&id).cloned()))
            .await
    }

    async fn find_expired_leases(&self, now: Timestamp) -> Result<Vec<Entry>, QueueError> {
        self.run(move |inner| Ok(inner.lock()?.expired_leases(&now)))
            .await
    }

    async fn list_by_state(&self, state: EntryState) -> Result<Vec<Entry>, QueueError> {
        self.run(move |inner| Ok(inner.lock()?.by_state(state)))
            .await
    }

    async fn counts(&self) -> Result<StateCounts, QueueError> {
        self.run(|inner| Ok(inner.lock()?.counts())).await
    }
}
