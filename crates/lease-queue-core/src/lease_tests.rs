//! Tests for the lease manager.

use super::*;
use crate::clock::ManualClock;
use crate::entry::EntryState;
use crate::store::InMemoryMessageStore;
use bytes::Bytes;

struct Fixture {
    store: Arc<InMemoryMessageStore>,
    clock: Arc<ManualClock>,
    leases: LeaseManager,
}

fn fixture(policy: RetryPolicy) -> Fixture {
    let store = Arc::new(InMemoryMessageStore::new());
    let clock = Arc::new(ManualClock::starting_now());
    let leases = LeaseManager::new(store.clone(), clock.clone(), policy);
    Fixture {
        store,
        clock,
        leases,
    }
}

impl Fixture {
    async fn enqueue(&self, body: &'static str) -> EntryId {
        self.store
            .insert(Bytes::from(body), self.clock.now())
            .await
            .unwrap()
    }

    async fn entry(&self, id: EntryId) -> Entry {
        self.store.get(id).await.unwrap().unwrap()
    }
}

// ============================================================================
// Grant Tests
// ============================================================================

mod grant {
    use super::*;

    /// Verify that a grant leases the entry and counts the delivery.
    #[tokio::test]
    async fn test_grant_leases_entry() {
        let f = fixture(RetryPolicy::default());
        let id = f.enqueue("a").await;

        let delivery = f.leases.grant(id, Duration::seconds(30)).await.unwrap();

        let entry = f.entry(id).await;
        assert_eq!(entry.state(), EntryState::Leased);
        assert_eq!(entry.delivery_count(), 1);
        assert_eq!(delivery.delivery_count, 1);
        assert_eq!(entry.lease_token(), Some(delivery.lease_token));
        assert_eq!(
            delivery.lease_expires_at,
            f.clock.now().add(Duration::seconds(30))
        );
        assert_eq!(delivery.payload_str(), Some("a"));
    }

    /// Verify that non-positive lease durations are rejected.
    #[tokio::test]
    async fn test_grant_rejects_non_positive_duration() {
        let f = fixture(RetryPolicy::default());
        let id = f.enqueue("a").await;

        for duration in [Duration::zero(), Duration::seconds(-1)] {
            let result = f.leases.grant(id, duration).await;
            assert!(matches!(result, Err(QueueError::ValidationError(_))));
        }
        assert_eq!(f.entry(id).await.delivery_count(), 0);
    }

    /// Verify that an already leased entry cannot be granted again.
    #[tokio::test]
    async fn test_second_grant_conflicts() {
        let f = fixture(RetryPolicy::default());
        let id = f.enqueue("a").await;

        f.leases.grant(id, Duration::seconds(30)).await.unwrap();
        let result = f.leases.grant(id, Duration::seconds(30)).await;

        assert!(matches!(result, Err(QueueError::Conflict { .. })));
    }
}

// ============================================================================
// Renew Tests
// ============================================================================

mod renew {
    use super::*;

    /// Verify that renewal moves the expiry relative to now.
    #[tokio::test]
    async fn test_renew_extends_from_now() {
        let f = fixture(RetryPolicy::default());
        let id = f.enqueue("a").await;
        let delivery = f.leases.grant(id, Duration::seconds(10)).await.unwrap();

        f.clock.advance(Duration::seconds(5));
        let expires_at = f
            .leases
            .renew(id, delivery.lease_token, Duration::seconds(10))
            .await
            .unwrap();

        assert_eq!(expires_at, f.clock.now().add(Duration::seconds(10)));
        let entry = f.entry(id).await;
        assert_eq!(entry.lease_expires_at(), Some(expires_at));
        assert_eq!(entry.delivery_count(), 1);
    }

    #[tokio::test]
    async fn test_renew_with_stale_token_is_invalid() {
        let f = fixture(RetryPolicy::default());
        let id = f.enqueue("a").await;
        f.leases.grant(id, Duration::seconds(10)).await.unwrap();

        let result = f
            .leases
            .renew(id, LeaseToken::new(), Duration::seconds(10))
            .await;

        assert!(matches!(result, Err(QueueError::InvalidToken { .. })));
    }

    /// Verify that a lease cannot be revived once its expiry passed.
    #[tokio::test]
    async fn test_renew_after_expiry_fails() {
        let f = fixture(RetryPolicy::default());
        let id = f.enqueue("a").await;
        let delivery = f.leases.grant(id, Duration::seconds(10)).await.unwrap();

        f.clock.advance(Duration::seconds(10));
        let result = f.leases.renew(id, delivery.lease_token, Duration::seconds(10)).await;

        assert!(matches!(
            result,
            Err(QueueError::LeaseExpired { expired_at, .. }) if expired_at == delivery.lease_expires_at
        ));
    }
}

// ============================================================================
// Release Tests
// ============================================================================

mod release {
    use super::*;

    #[tokio::test]
    async fn test_success_deletes_entry() {
        let f = fixture(RetryPolicy::default());
        let id = f.enqueue("a").await;
        let delivery = f.leases.grant(id, Duration::seconds(10)).await.unwrap();

        let disposition = f
            .leases
            .release(id, delivery.lease_token, ReleaseOutcome::Success)
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Deleted);
        assert!(f.store.get(id).await.unwrap().is_none());
    }

    /// Verify that a failure requeues with the policy's backoff.
    #[tokio::test]
    async fn test_failure_requeues_with_backoff() {
        let f = fixture(RetryPolicy::new(3, Duration::seconds(2), Duration::seconds(60)));
        let id = f.enqueue("a").await;
        let delivery = f.leases.grant(id, Duration::seconds(10)).await.unwrap();

        let disposition = f
            .leases
            .release(id, delivery.lease_token, ReleaseOutcome::Failure)
            .await
            .unwrap();

        let expected = f.clock.now().add(Duration::seconds(2));
        assert_eq!(
            disposition,
            Disposition::Requeued {
                visible_after: expected
            }
        );
        let entry = f.entry(id).await;
        assert_eq!(entry.state(), EntryState::Visible);
        assert_eq!(entry.visible_after(), expected);
        assert_eq!(entry.lease_token(), None);
    }

    /// Verify that the last allowed delivery failing quarantines the entry.
    #[tokio::test]
    async fn test_failure_on_last_attempt_quarantines() {
        let f = fixture(RetryPolicy::new(1, Duration::seconds(1), Duration::seconds(1)));
        let id = f.enqueue("a").await;
        let delivery = f.leases.grant(id, Duration::seconds(10)).await.unwrap();

        let disposition = f
            .leases
            .release(id, delivery.lease_token, ReleaseOutcome::Failure)
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Quarantined);
        assert_eq!(f.entry(id).await.state(), EntryState::Quarantined);
    }

    #[tokio::test]
    async fn test_release_with_wrong_token_is_invalid() {
        let f = fixture(RetryPolicy::default());
        let id = f.enqueue("a").await;
        f.leases.grant(id, Duration::seconds(10)).await.unwrap();

        let result = f
            .leases
            .release(id, LeaseToken::new(), ReleaseOutcome::Success)
            .await;

        assert!(matches!(result, Err(QueueError::InvalidToken { .. })));
        assert_eq!(f.entry(id).await.state(), EntryState::Leased);
    }

    #[tokio::test]
    async fn test_release_after_expiry_fails() {
        let f = fixture(RetryPolicy::default());
        let id = f.enqueue("a").await;
        let delivery = f.leases.grant(id, Duration::seconds(10)).await.unwrap();

        f.clock.advance(Duration::seconds(11));
        let result = f
            .leases
            .release(id, delivery.lease_token, ReleaseOutcome::Success)
            .await;

        assert!(matches!(result, Err(QueueError::LeaseExpired { .. })));
        assert!(f.store.get(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_release_unknown_entry_is_not_found() {
        let f = fixture(RetryPolicy::default());

        let result = f
            .leases
            .release(EntryId::new(), LeaseToken::new(), ReleaseOutcome::Success)
            .await;

        assert!(matches!(result, Err(QueueError::NotFound { .. })));
    }
}

// ============================================================================
// Reap Tests
// ============================================================================

mod reap {
    use super::*;

    /// Verify that expired leases are requeued and live ones are left alone.
    #[tokio::test]
    async fn test_reap_reclaims_only_expired() {
        let f = fixture(RetryPolicy::default());
        let short = f.enqueue("short").await;
        let long = f.enqueue("long").await;
        f.leases.grant(short, Duration::seconds(1)).await.unwrap();
        f.leases.grant(long, Duration::seconds(60)).await.unwrap();

        f.clock.advance(Duration::seconds(2));
        let reclaimed = f.leases.reap_expired().await.unwrap();

        assert_eq!(reclaimed, 1);
        let entry = f.entry(short).await;
        assert_eq!(entry.state(), EntryState::Visible);
        assert_eq!(entry.delivery_count(), 1);
        assert_eq!(f.entry(long).await.state(), EntryState::Leased);
    }

    /// Verify that an exhausted entry is quarantined by the reaper.
    #[tokio::test]
    async fn test_reap_quarantines_exhausted_entry() {
        let f = fixture(RetryPolicy::new(1, Duration::seconds(1), Duration::seconds(1)));
        let id = f.enqueue("a").await;
        f.leases.grant(id, Duration::seconds(1)).await.unwrap();

        f.clock.advance(Duration::seconds(1));
        assert_eq!(f.leases.reap_expired().await.unwrap(), 1);

        assert_eq!(f.entry(id).await.state(), EntryState::Quarantined);
    }

    /// Verify that the old holder cannot act after its lease was reclaimed.
    #[tokio::test]
    async fn test_old_holder_rejected_after_reap() {
        let f = fixture(RetryPolicy::default());
        let id = f.enqueue("a").await;
        let delivery = f.leases.grant(id, Duration::seconds(1)).await.unwrap();

        f.clock.advance(Duration::seconds(5));
        f.leases.reap_expired().await.unwrap();

        let result = f
            .leases
            .release(id, delivery.lease_token, ReleaseOutcome::Success)
            .await;
        assert!(matches!(result, Err(QueueError::InvalidToken { .. })));
    }

    #[tokio::test]
    async fn test_reap_with_nothing_expired() {
        let f = fixture(RetryPolicy::default());
        f.enqueue("a").await;

        assert_eq!(f.leases.reap_expired().await.unwrap(), 0);
    }
}
