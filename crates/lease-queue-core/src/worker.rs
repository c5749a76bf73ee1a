//! Queue-triggered task processing.
//!
//! A [`Worker`] repeatedly dequeues an entry, hands it to a [`TaskHandler`] and
//! reports the result: `Ok` acks the entry, `Err` fails it so the retry policy
//! decides between backoff and quarantine. While the handler runs the lease is
//! extended every heartbeat interval. If an extension shows the lease was lost,
//! the handler is dropped and the entry is left to its new owner.

use crate::clock::timer_period;
use crate::config::WorkerConfig;
use crate::entry::Delivery;
use crate::error::QueueError;
use crate::service::QueueService;
use anyhow::Context;
use async_trait::async_trait;
use chrono::Duration;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;

// ============================================================================
// Handler Seam
// ============================================================================

/// Processes the payload of one delivery
///
/// Returning `Err` marks the delivery as failed. Handlers must tolerate being
/// called more than once for the same entry.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()>;
}

/// Handler that logs each task and simulates work by sleeping
#[derive(Debug, Clone)]
pub struct LoggingHandler {
    processing_time: std::time::Duration,
}

impl LoggingHandler {
    pub fn new(processing_time: std::time::Duration) -> Self {
        Self { processing_time }
    }
}

impl Default for LoggingHandler {
    fn default() -> Self {
        Self::new(std::time::Duration::from_secs(2))
    }
}

#[async_trait]
impl TaskHandler for LoggingHandler {
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()> {
        let task = delivery
            .payload_str()
            .context("task payload is not valid UTF-8")?;

        info!(
            entry_id = %delivery.entry_id,
            delivery_count = delivery.delivery_count,
            enqueued_at = %delivery.enqueued_at,
            task,
            "Task received"
        );

        tokio::time::sleep(self.processing_time).await;

        info!(entry_id = %delivery.entry_id, task, "Task completed");
        Ok(())
    }
}

// ============================================================================
// Worker Loop
// ============================================================================

/// Counts of how deliveries handled by a worker ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Handler succeeded and the entry was deleted
    pub acked: u64,

    /// Handler failed and the entry went back to the retry policy
    pub failed: u64,

    /// The lease was lost before the result could be reported
    pub abandoned: u64,
}

impl WorkerStats {
    pub fn handled(&self) -> u64 {
        self.acked + self.failed + self.abandoned
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskOutcome {
    Acked,
    Failed,
    Abandoned,
}

/// Dequeue-handle-report loop over a [`QueueService`]
pub struct Worker {
    service: QueueService,
    handler: Arc<dyn TaskHandler>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        service: QueueService,
        handler: Arc<dyn TaskHandler>,
        config: WorkerConfig,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        Ok(Self {
            service,
            handler,
            config,
        })
    }

    /// Run on its own task
    pub fn spawn(
        self,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<Result<WorkerStats, QueueError>> {
        tokio::spawn(self.run(shutdown))
    }

    /// Process deliveries until shutdown, `max_tasks`, or (when configured) an
    /// empty queue
    ///
    /// A task already being handled when shutdown is requested runs to
    /// completion and is reported. Transient dequeue errors are retried after
    /// the error's suggested delay; anything else ends the loop with an error.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<WorkerStats, QueueError> {
        let lease_duration = self.config.lease_duration();
        let mut stats = WorkerStats::default();

        info!(
            lease_ms = self.config.lease_duration_ms,
            heartbeat_ms = self.config.heartbeat_interval_ms,
            "Worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            if self
                .config
                .max_tasks
                .is_some_and(|max| stats.handled() >= max)
            {
                debug!(handled = stats.handled(), "Task limit reached");
                break;
            }

            let delivery = match self.service.dequeue(lease_duration).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    if self.config.stop_when_empty {
                        debug!("Queue drained");
                        break;
                    }
                    if pause(&mut shutdown, self.config.poll_interval()).await {
                        break;
                    }
                    continue;
                }
                Err(e) if e.is_transient() => {
                    let delay = e.retry_after().unwrap_or_else(|| self.config.poll_interval());
                    warn!(error = %e, delay_ms = delay.num_milliseconds(), "Dequeue failed, backing off");
                    if pause(&mut shutdown, delay).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Dequeue failed permanently, stopping worker");
                    return Err(e);
                }
            };

            match self.process(&delivery).await {
                TaskOutcome::Acked => stats.acked += 1,
                TaskOutcome::Failed => stats.failed += 1,
                TaskOutcome::Abandoned => stats.abandoned += 1,
            }
        }

        info!(
            acked = stats.acked,
            failed = stats.failed,
            abandoned = stats.abandoned,
            "Worker stopped"
        );
        Ok(stats)
    }

    async fn process(&self, delivery: &Delivery) -> TaskOutcome {
        let id = delivery.entry_id;
        let token = delivery.lease_token;

        let period = timer_period(self.config.heartbeat_interval());
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let handling = self.handler.handle(delivery);
        tokio::pin!(handling);

        let result = loop {
            tokio::select! {
                result = &mut handling => break result,
                _ = heartbeat.tick() => {
                    match self.service.extend(id, token, self.config.lease_duration()).await {
                        Ok(expires_at) => {
                            debug!(entry_id = %id, expires_at = %expires_at, "Lease extended");
                        }
                        Err(e) if lost_ownership(&e) => {
                            warn!(entry_id = %id, error = %e, "Lease lost while handling, abandoning task");
                            return TaskOutcome::Abandoned;
                        }
                        Err(e) => {
                            warn!(entry_id = %id, error = %e, "Lease extension failed, will retry");
                        }
                    }
                }
            }
        };

        match result {
            Ok(()) => match self.service.ack(id, token).await {
                Ok(()) => TaskOutcome::Acked,
                Err(e) => {
                    warn!(entry_id = %id, error = %e, "Could not ack completed task");
                    TaskOutcome::Abandoned
                }
            },
            Err(err) => {
                let reason = format!("{:#}", err);
                error!(
                    entry_id = %id,
                    delivery_count = delivery.delivery_count,
                    error = %reason,
                    "Task handler failed"
                );
                match self.service.fail(id, token).await {
                    Ok(_) => TaskOutcome::Failed,
                    Err(e) => {
                        warn!(entry_id = %id, error = %e, "Could not report failed task");
                        TaskOutcome::Abandoned
                    }
                }
            }
        }
    }
}

fn lost_ownership(error: &QueueError) -> bool {
    error.is_lost_lease() || matches!(error, QueueError::NotFound { .. })
}

/// Wait for `duration` or a shutdown signal; returns true once the signal
/// sender is gone
async fn pause(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        changed = shutdown.changed() => changed.is_err(),
        _ = tokio::time::sleep(timer_period(duration)) => false,
    }
}
