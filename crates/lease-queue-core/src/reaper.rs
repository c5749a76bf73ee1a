//! Background sweep that returns expired leases to the queue.
//!
//! Dequeue already reclaims lazily when it finds nothing visible; the reaper
//! makes sure abandoned work comes back even when no consumer is polling.

use crate::clock::timer_period;
use crate::service::QueueService;
use chrono::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "reaper_tests.rs"]
mod tests;

/// Periodically calls [`QueueService::reap_expired`] until told to stop
pub struct Reaper {
    service: QueueService,
    interval: Duration,
}

impl Reaper {
    /// Sweep at the service's configured reap interval
    pub fn new(service: QueueService) -> Self {
        let interval = service.config().reap_interval();
        Self::with_interval(service, interval)
    }

    pub fn with_interval(service: QueueService, interval: Duration) -> Self {
        Self { service, interval }
    }

    /// Run on its own task
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<usize> {
        tokio::spawn(self.run(shutdown))
    }

    /// Sweep until `shutdown` turns true or its sender is dropped
    ///
    /// Sweep failures are logged and the next tick tries again. Returns the
    /// total number of entries reclaimed.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> usize {
        let mut ticker = tokio::time::interval(timer_period(self.interval));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_ms = self.interval.num_milliseconds(),
            "Lease reaper started"
        );

        let mut total = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.service.reap_expired().await {
                        Ok(0) => {}
                        Ok(reclaimed) => {
                            total += reclaimed;
                            info!(reclaimed, "Expired leases reclaimed");
                        }
                        Err(e) => {
                            warn!(error = %e, transient = e.is_transient(), "Lease sweep failed");
                        }
                    }
                }
            }
        }

        debug!(total, "Lease reaper stopped");
        total
    }
}
