//! Tests for the file-backed message store.

use super::*;
use crate::entry::LeaseToken;
use chrono::Duration;
use tempfile::TempDir;

async fn open(dir: &TempDir) -> FileMessageStore {
    FileMessageStore::open(dir.path().to_path_buf())
        .await
        .expect("store should open")
}

// ============================================================================
// Open Tests
// ============================================================================

mod open_tests {
    use super::*;

    /// Verify that opening an empty directory creates the layout.
    #[tokio::test]
    async fn test_open_creates_entries_directory() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;

        assert!(store.entries_dir().is_dir());
        assert_eq!(store.counts().await.unwrap().total(), 0);
    }

    /// Verify that leftover temporary files are removed on open.
    #[tokio::test]
    async fn test_open_discards_stray_temp_files() {
        let dir = TempDir::new().unwrap();
        let entries = dir.path().join("entries");
        std::fs::create_dir_all(&entries).unwrap();
        let stray = entries.join("01ARZ3NDEKTSV4RRFFQ69G5FAV.json.tmp");
        std::fs::write(&stray, b"{ half written").unwrap();

        let store = open(&dir).await;

        assert!(!stray.exists());
        assert_eq!(store.counts().await.unwrap().total(), 0);
    }

    /// Verify that an unreadable record is reported as a storage failure.
    #[tokio::test]
    async fn test_open_rejects_corrupt_record() {
        let dir = TempDir::new().unwrap();
        let entries = dir.path().join("entries");
        std::fs::create_dir_all(&entries).unwrap();
        std::fs::write(entries.join("01ARZ3NDEKTSV4RRFFQ69G5FAV.json"), b"not json").unwrap();

        let result = FileMessageStore::open(dir.path().to_path_buf()).await;

        assert!(matches!(result, Err(QueueError::StorageUnavailable { .. })));
    }
}

// ============================================================================
// Persistence Tests
// ============================================================================

mod persistence {
    use super::*;

    /// Verify that inserts are written as one record per entry.
    #[tokio::test]
    async fn test_insert_writes_record() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;

        let id = store
            .insert(Bytes::from("payload"), Timestamp::now())
            .await
            .unwrap();

        assert!(store.entries_dir().join(format!("{}.json", id)).is_file());
    }

    /// Verify that state, lease and delivery count survive a reopen.
    #[tokio::test]
    async fn test_reopen_restores_entries() {
        let dir = TempDir::new().unwrap();
        let now = Timestamp::now();
        let token = LeaseToken::new();
        let expires = now.add(Duration::seconds(30));

        let (leased, visible) = {
            let store = open(&dir).await;
            let leased = store.insert(Bytes::from("leased"), now).await.unwrap();
            let visible = store.insert(Bytes::from("visible"), now).await.unwrap();
            store
                .compare_and_transition(leased, Expectation::visible(), Transition::grant(token, expires))
                .await
                .unwrap();
            (leased, visible)
        };

        let reopened = open(&dir).await;
        let entry = reopened.get(leased).await.unwrap().unwrap();
        assert_eq!(entry.state(), EntryState::Leased);
        assert_eq!(entry.lease_token(), Some(token));
        assert_eq!(entry.lease_expires_at(), Some(expires));
        assert_eq!(entry.delivery_count(), 1);
        assert_eq!(entry.payload(), &Bytes::from("leased"));

        let oldest = reopened.fetch_oldest_visible(now).await.unwrap().unwrap();
        assert_eq!(oldest.id(), visible);
    }

    /// Verify that deleting an entry removes its record permanently.
    #[tokio::test]
    async fn test_delete_removes_record() {
        let dir = TempDir::new().unwrap();
        let now = Timestamp::now();
        let id = {
            let store = open(&dir).await;
            let id = store.insert(Bytes::from("x"), now).await.unwrap();
            store
                .compare_and_transition(id, Expectation::visible(), Transition::delete())
                .await
                .unwrap();
            assert!(!store.entries_dir().join(format!("{}.json", id)).exists());
            id
        };

        let reopened = open(&dir).await;
        assert!(reopened.get(id).await.unwrap().is_none());
        assert_eq!(reopened.counts().await.unwrap().total(), 0);
    }

    /// Verify that a failed expectation leaves the record untouched.
    #[tokio::test]
    async fn test_conflict_does_not_write() {
        let dir = TempDir::new().unwrap();
        let now = Timestamp::now();
        let store = open(&dir).await;
        let id = store.insert(Bytes::from("x"), now).await.unwrap();

        let result = store
            .compare_and_transition(id, Expectation::leased(LeaseToken::new()), Transition::delete())
            .await;
        assert!(matches!(result, Err(QueueError::Conflict { .. })));

        let reopened = open(&dir).await;
        assert_eq!(
            reopened.get(id).await.unwrap().unwrap().state(),
            EntryState::Visible
        );
    }

    /// Verify that quarantined entries are listed after a reopen.
    #[tokio::test]
    async fn test_quarantine_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let now = Timestamp::now();
        let id = {
            let store = open(&dir).await;
            let id = store.insert(Bytes::from("poison"), now).await.unwrap();
            let token = LeaseToken::new();
            store
                .compare_and_transition(id, Expectation::visible(), Transition::grant(token, now.add(Duration::seconds(1))))
                .await
                .unwrap();
            store
                .compare_and_transition(id, Expectation::leased(token), Transition::quarantine())
                .await
                .unwrap();
            id
        };

        let reopened = open(&dir).await;
        let quarantined = reopened.list_by_state(EntryState::Quarantined).await.unwrap();
        assert_eq!(quarantined.len(), 1);
        assert_eq!(quarantined[0].id(), id);
        assert!(reopened.fetch_oldest_visible(now).await.unwrap().is_none());
    }

    /// Verify that ids allocated after a reopen sort after the loaded ones,
    /// even when the clock reads earlier than when they were created.
    #[tokio::test]
    async fn test_ids_after_reopen_sort_after_loaded_ids() {
        let dir = TempDir::new().unwrap();
        let now = Timestamp::now();
        let existing = {
            let store = open(&dir).await;
            store
                .insert(Bytes::from("before restart"), now.add(Duration::minutes(10)))
                .await
                .unwrap()
        };

        let reopened = open(&dir).await;
        let fresh = reopened.insert(Bytes::from("after restart"), now).await.unwrap();

        assert!(fresh > existing);
    }
}

// ============================================================================
// Directory Sync Tests
// ============================================================================

mod directory_sync {
    use super::*;

    /// Verify that syncing the entries directory succeeds while it exists.
    #[tokio::test]
    async fn test_sync_dir_succeeds_on_open_store() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;

        assert!(store.inner.sync_dir().is_ok());
    }

    /// Verify that a missing entries directory surfaces as a storage failure.
    #[cfg(unix)]
    #[tokio::test]
    async fn test_sync_dir_reports_missing_directory() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        std::fs::remove_dir_all(store.entries_dir()).unwrap();

        let result = store.inner.sync_dir();

        assert!(matches!(result, Err(QueueError::StorageUnavailable { .. })));
    }

    /// Verify that a removal is followed by a successful directory sync.
    #[tokio::test]
    async fn test_remove_then_insert_keeps_directory_consistent() {
        let dir = TempDir::new().unwrap();
        let now = Timestamp::now();
        let store = open(&dir).await;
        let removed = store.insert(Bytes::from("gone"), now).await.unwrap();
        store
            .compare_and_transition(removed, Expectation::visible(), Transition::delete())
            .await
            .unwrap();
        let kept = store.insert(Bytes::from("kept"), now).await.unwrap();

        let listed: Vec<_> = std::fs::read_dir(store.entries_dir())
            .unwrap()
            .map(|item| item.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(listed, vec![format!("{}.json", kept)]);
    }
}
