//! Public queue operations for producers, consumers and operators.
//!
//! [`QueueService`] is cheap to clone; clones share the store, the clock and
//! the lease manager. There is no lock above the store: concurrent dequeues
//! race on the store's compare-and-transition and the loser simply moves on to
//! the next candidate.

use crate::clock::{Clock, SystemClock};
use crate::config::QueueConfig;
use crate::entry::{Delivery, Entry, EntryId, EntryState, Expectation, LeaseToken, Timestamp, Transition};
use crate::error::QueueError;
use crate::lease::{validate_duration, Disposition, LeaseManager, ReleaseOutcome};
use crate::store::{open_store, MessageStore, StateCounts};
use bytes::Bytes;
use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, info, instrument};

#[cfg(test)]
#[path = "service_tests.rs"]
mod tests;

/// Orchestrates enqueue, dequeue, ack, fail and extend over a message store
///
/// # Examples
///
/// ```rust
/// use lease_queue_core::{InMemoryMessageStore, QueueConfig, QueueService};
/// use chrono::Duration;
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let service = QueueService::new(Arc::new(InMemoryMessageStore::new()), QueueConfig::default()).unwrap();
///
/// let id = service.enqueue("Send welcome email to new user").await.unwrap();
/// let delivery = service.dequeue(Duration::seconds(30)).await.unwrap().unwrap();
/// assert_eq!(delivery.entry_id, id);
/// assert_eq!(delivery.delivery_count, 1);
///
/// service.ack(id, delivery.lease_token).await.unwrap();
/// assert!(service.get(id).await.unwrap().is_none());
/// # });
/// ```
#[derive(Clone)]
pub struct QueueService {
    store: Arc<dyn MessageStore>,
    clock: Arc<dyn Clock>,
    leases: LeaseManager,
    config: Arc<QueueConfig>,
}

impl QueueService {
    /// Create a service reading time from the system clock
    pub fn new(store: Arc<dyn MessageStore>, config: QueueConfig) -> Result<Self, QueueError> {
        Self::with_clock(store, Arc::new(SystemClock::new()), config)
    }

    /// Create a service with an explicit time source
    pub fn with_clock(
        store: Arc<dyn MessageStore>,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
    ) -> Result<Self, QueueError> {
        config.validate()?;

        let leases = LeaseManager::new(store.clone(), clock.clone(), config.retry_policy());
        Ok(Self {
            store,
            clock,
            leases,
            config: Arc::new(config),
        })
    }

    /// Open the configured store and build a service on top of it
    pub async fn open(config: QueueConfig) -> Result<Self, QueueError> {
        config.validate()?;
        let store = open_store(&config.storage).await?;
        Self::new(store, config)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    // ========================================================================
    // Producer
    // ========================================================================

    /// Add a payload to the queue
    pub async fn enqueue(&self, payload: impl Into<Bytes>) -> Result<EntryId, QueueError> {
        let payload = payload.into();
        self.check_payload(&payload)?;

        let size = payload.len();
        let id = self.store.insert(payload, self.clock.now()).await?;
        info!(entry_id = %id, size, "Entry enqueued");
        Ok(id)
    }

    /// Add several payloads, oldest first
    ///
    /// Every payload is size-checked before anything is written. The inserts
    /// themselves are not atomic as a group: on a storage failure the entries
    /// already written stay queued.
    pub async fn enqueue_batch<I, P>(&self, payloads: I) -> Result<Vec<EntryId>, QueueError>
    where
        I: IntoIterator<Item = P>,
        P: Into<Bytes>,
    {
        let payloads: Vec<Bytes> = payloads.into_iter().map(Into::into).collect();
        for payload in &payloads {
            self.check_payload(payload)?;
        }

        let mut ids = Vec::with_capacity(payloads.len());
        for payload in payloads {
            ids.push(self.store.insert(payload, self.clock.now()).await?);
        }

        info!(count = ids.len(), "Batch enqueued");
        Ok(ids)
    }

    fn check_payload(&self, payload: &Bytes) -> Result<(), QueueError> {
        if payload.len() > self.config.max_payload_bytes {
            return Err(QueueError::PayloadTooLarge {
                size: payload.len(),
                max_size: self.config.max_payload_bytes,
            });
        }
        Ok(())
    }

    // ========================================================================
    // Consumer
    // ========================================================================

    /// Lease the oldest available entry for `lease_duration`
    ///
    /// Returns `None` when nothing is visible, after one attempt at reclaiming
    /// expired leases. Fails with [`QueueError::Busy`] when
    /// `max_dequeue_attempts` grants in a row lost their race to another
    /// consumer; the lazy reclaim does not count as an attempt.
    #[instrument(skip(self))]
    pub async fn dequeue(&self, lease_duration: Duration) -> Result<Option<Delivery>, QueueError> {
        validate_duration(lease_duration)?;

        let attempts = self.config.max_dequeue_attempts;
        let mut lost_races = 0;
        let mut reaped = false;

        while lost_races < attempts {
            let candidate = self.store.fetch_oldest_visible(self.clock.now()).await?;

            let Some(entry) = candidate else {
                if !reaped {
                    reaped = true;
                    if self.leases.reap_expired().await? > 0 {
                        continue;
                    }
                }
                return Ok(None);
            };

            match self.leases.grant(entry.id(), lease_duration).await {
                Ok(delivery) => {
                    info!(
                        entry_id = %delivery.entry_id,
                        delivery_count = delivery.delivery_count,
                        "Entry dequeued"
                    );
                    return Ok(Some(delivery));
                }
                Err(QueueError::Conflict { .. }) | Err(QueueError::NotFound { .. }) => {
                    lost_races += 1;
                    debug!(entry_id = %entry.id(), lost_races, "Lost grant race, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(QueueError::Busy { attempts })
    }

    /// Dequeue using the configured default lease duration
    pub async fn dequeue_with_default_lease(&self) -> Result<Option<Delivery>, QueueError> {
        self.dequeue(self.config.default_lease_duration()).await
    }

    /// Report successful processing; the entry is deleted
    pub async fn ack(&self, id: EntryId, token: LeaseToken) -> Result<(), QueueError> {
        self.leases
            .release(id, token, ReleaseOutcome::Success)
            .await
            .map(|_| ())
    }

    /// Report failed processing; the entry is requeued with backoff or quarantined
    pub async fn fail(&self, id: EntryId, token: LeaseToken) -> Result<Disposition, QueueError> {
        self.leases.release(id, token, ReleaseOutcome::Failure).await
    }

    /// Renew the caller's lease for another `duration` from now
    pub async fn extend(
        &self,
        id: EntryId,
        token: LeaseToken,
        duration: Duration,
    ) -> Result<Timestamp, QueueError> {
        self.leases.renew(id, token, duration).await
    }

    /// Reclaim every lease that has run out
    pub async fn reap_expired(&self) -> Result<usize, QueueError> {
        self.leases.reap_expired().await
    }

    // ========================================================================
    // Operator
    // ========================================================================

    /// Entries that exhausted their delivery attempts, oldest first
    pub async fn list_quarantined(&self) -> Result<Vec<Entry>, QueueError> {
        self.store.list_by_state(EntryState::Quarantined).await
    }

    /// Put a quarantined entry back in circulation immediately
    ///
    /// The delivery count is kept, so an entry that fails again is quarantined
    /// on its next failure.
    pub async fn requeue_quarantined(&self, id: EntryId) -> Result<Entry, QueueError> {
        let entry = self
            .store
            .compare_and_transition(
                id,
                Expectation::quarantined(),
                Transition::requeue(self.clock.now()),
            )
            .await?;

        info!(
            entry_id = %id,
            delivery_count = entry.delivery_count(),
            "Quarantined entry requeued by operator"
        );
        Ok(entry)
    }

    /// Permanently delete a quarantined entry
    pub async fn purge_quarantined(&self, id: EntryId) -> Result<(), QueueError> {
        self.store
            .compare_and_transition(id, Expectation::quarantined(), Transition::delete())
            .await?;

        info!(entry_id = %id, "Quarantined entry purged by operator");
        Ok(())
    }

    /// Point lookup of a live entry
    pub async fn get(&self, id: EntryId) -> Result<Option<Entry>, QueueError> {
        self.store.get(id).await
    }

    /// Number of live entries per state
    pub async fn stats(&self) -> Result<StateCounts, QueueError> {
        self.store.counts().await
    }
}
