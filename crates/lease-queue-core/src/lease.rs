//! Lease issuance, renewal, release and reclamation.
//!
//! The [`LeaseManager`] never keeps its own copy of lease state. Every decision
//! is made against the entry read from the store and committed with a
//! compare-and-transition keyed on the caller's token, so a lease that changed
//! hands in the meantime is detected by the store rather than by this module.

use crate::clock::Clock;
use crate::entry::{Delivery, Entry, EntryId, Expectation, LeaseToken, Timestamp, Transition};
use crate::error::{QueueError, ValidationError};
use crate::retry::{RetryAction, RetryPolicy};
use crate::store::MessageStore;
use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
#[path = "lease_tests.rs"]
mod tests;

/// How the consumer finished with a leased entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Success,
    Failure,
}

/// Where an entry ended up after a release or a reap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Removed permanently
    Deleted,

    /// Visible again once `visible_after` has passed
    Requeued { visible_after: Timestamp },

    /// Parked until an operator requeues or purges it
    Quarantined,
}

/// Issues and tracks leases on top of a [`MessageStore`]
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn MessageStore>,
    clock: Arc<dyn Clock>,
    retry_policy: RetryPolicy,
}

impl LeaseManager {
    pub fn new(
        store: Arc<dyn MessageStore>,
        clock: Arc<dyn Clock>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            retry_policy,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Lease a `Visible` entry whose backoff has elapsed to a new holder for
    /// `duration`
    ///
    /// Returns the delivery as it looks after the grant, carrying the new token
    /// and expiry. Fails with [`QueueError::Conflict`] if another consumer
    /// leased the entry first.
    #[instrument(skip(self), fields(entry_id = %id))]
    pub async fn grant(&self, id: EntryId, duration: Duration) -> Result<Delivery, QueueError> {
        validate_duration(duration)?;

        let now = self.clock.now();
        let token = LeaseToken::new();
        let expires_at = now.add(duration);
        let entry = self
            .store
            .compare_and_transition(id, Expectation::available(now), Transition::grant(token, expires_at))
            .await?;

        debug!(
            delivery_count = entry.delivery_count(),
            expires_at = %expires_at,
            "Lease granted"
        );

        Delivery::from_entry(&entry)
            .ok_or_else(|| QueueError::storage(format!("entry {} was not leased by grant", id)))
    }

    /// Push out the expiry of a lease the caller still holds
    #[instrument(skip(self, token), fields(entry_id = %id))]
    pub async fn renew(
        &self,
        id: EntryId,
        token: LeaseToken,
        duration: Duration,
    ) -> Result<Timestamp, QueueError> {
        validate_duration(duration)?;

        let now = self.clock.now();
        self.held_entry(id, token, now).await?;

        let expires_at = now.add(duration);
        self.store
            .compare_and_transition(id, Expectation::leased(token), Transition::renew(token, expires_at))
            .await
            .map_err(|e| lost_race(id, e))?;

        debug!(expires_at = %expires_at, "Lease renewed");
        Ok(expires_at)
    }

    /// End a lease the caller still holds
    ///
    /// Success deletes the entry; failure hands it to the retry policy.
    #[instrument(skip(self, token), fields(entry_id = %id))]
    pub async fn release(
        &self,
        id: EntryId,
        token: LeaseToken,
        outcome: ReleaseOutcome,
    ) -> Result<Disposition, QueueError> {
        let now = self.clock.now();
        let entry = self.held_entry(id, token, now).await?;

        let (transition, disposition) = match outcome {
            ReleaseOutcome::Success => (Transition::delete(), Disposition::Deleted),
            ReleaseOutcome::Failure => self.after_failure(&entry, now),
        };

        self.store
            .compare_and_transition(id, Expectation::leased(token), transition)
            .await
            .map_err(|e| lost_race(id, e))?;

        log_disposition(&entry, disposition);
        Ok(disposition)
    }

    /// Return every expired lease to the queue (or quarantine)
    ///
    /// Entries whose holder acted first are skipped. Returns the number of
    /// entries reclaimed.
    pub async fn reap_expired(&self) -> Result<usize, QueueError> {
        let now = self.clock.now();
        let expired = self.store.find_expired_leases(now).await?;

        let mut reclaimed = 0;
        for entry in expired {
            let Some(token) = entry.lease_token() else {
                continue;
            };

            let (transition, disposition) = self.after_failure(&entry, now);
            match self
                .store
                .compare_and_transition(entry.id(), Expectation::leased(token), transition)
                .await
            {
                Ok(_) => {
                    reclaimed += 1;
                    info!(
                        entry_id = %entry.id(),
                        delivery_count = entry.delivery_count(),
                        "Reclaimed expired lease"
                    );
                    log_disposition(&entry, disposition);
                }
                Err(QueueError::Conflict { .. }) | Err(QueueError::NotFound { .. }) => {
                    debug!(entry_id = %entry.id(), "Lease holder finished before reclaim");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(reclaimed)
    }

    /// Load `id` and check that `token` is its live lease at `now`
    async fn held_entry(
        &self,
        id: EntryId,
        token: LeaseToken,
        now: Timestamp,
    ) -> Result<Entry, QueueError> {
        let entry = self
            .store
            .get(id)
            .await?
            .ok_or(QueueError::NotFound { entry_id: id })?;

        let lease = match entry.lease() {
            Some(lease) if lease.token == token => lease,
            _ => return Err(QueueError::InvalidToken { entry_id: id }),
        };

        if lease.is_expired(&now) {
            return Err(QueueError::LeaseExpired {
                entry_id: id,
                expired_at: lease.expires_at,
            });
        }

        Ok(entry)
    }

    fn after_failure(&self, entry: &Entry, now: Timestamp) -> (Transition, Disposition) {
        match self.retry_policy.on_failure(entry) {
            RetryAction::Requeue { delay } => {
                let visible_after = now.add(delay);
                (
                    Transition::requeue(visible_after),
                    Disposition::Requeued { visible_after },
                )
            }
            RetryAction::Quarantine => (Transition::quarantine(), Disposition::Quarantined),
        }
    }
}

/// Lease durations must be strictly positive
pub(crate) fn validate_duration(duration: Duration) -> Result<(), QueueError> {
    if duration <= Duration::zero() {
        return Err(ValidationError::OutOfRange {
            field: "lease_duration".to_string(),
            message: format!("must be positive, got {}ms", duration.num_milliseconds()),
        }
        .into());
    }
    Ok(())
}

/// A conflict after the ownership check means someone else moved the entry
fn lost_race(id: EntryId, error: QueueError) -> QueueError {
    match error {
        QueueError::Conflict { .. } | QueueError::NotFound { .. } => {
            QueueError::InvalidToken { entry_id: id }
        }
        other => other,
    }
}

fn log_disposition(entry: &Entry, disposition: Disposition) {
    match disposition {
        Disposition::Deleted => {
            debug!(entry_id = %entry.id(), "Entry completed");
        }
        Disposition::Requeued { visible_after } => {
            info!(
                entry_id = %entry.id(),
                delivery_count = entry.delivery_count(),
                visible_after = %visible_after,
                "Entry requeued with backoff"
            );
        }
        Disposition::Quarantined => {
            warn!(
                entry_id = %entry.id(),
                delivery_count = entry.delivery_count(),
                "Entry quarantined after exhausting delivery attempts"
            );
        }
    }
}
