//! Common test utilities for lease-queue integration tests
//!
//! This module provides:
//! - Service builders over both storage backends with a manual clock
//! - Configuration presets
//! - A task handler that records what it saw

use async_trait::async_trait;
use chrono::Duration;
use lease_queue_core::{
    Delivery, FileMessageStore, InMemoryMessageStore, ManualClock, MessageStore, QueueConfig,
    QueueService, TaskHandler,
};
use std::path::Path;
use std::sync::{Arc, Mutex};

// ============================================================================
// Service Builders
// ============================================================================

/// Queue configuration with a fixed number of attempts and 1s..8s backoff
#[allow(dead_code)]
pub fn config_with_attempts(max_delivery_attempts: u32) -> QueueConfig {
    QueueConfig {
        max_delivery_attempts,
        base_delay_ms: 1_000,
        max_backoff_ms: 8_000,
        ..QueueConfig::default()
    }
}

/// In-memory service driven by a manual clock
#[allow(dead_code)]
pub fn memory_service(config: QueueConfig) -> (QueueService, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::starting_now());
    let service = service_over(Arc::new(InMemoryMessageStore::new()), clock.clone(), config);
    (service, clock)
}

/// File-backed service rooted at `root` sharing `clock`
#[allow(dead_code)]
pub async fn file_service(
    root: &Path,
    clock: Arc<ManualClock>,
    config: QueueConfig,
) -> QueueService {
    let store = FileMessageStore::open(root.to_path_buf()).await.unwrap();
    service_over(Arc::new(store), clock, config)
}

fn service_over(
    store: Arc<dyn MessageStore>,
    clock: Arc<ManualClock>,
    config: QueueConfig,
) -> QueueService {
    QueueService::with_clock(store, clock, config).unwrap()
}

/// Standard lease used by tests that do not care about expiry
#[allow(dead_code)]
pub fn lease() -> Duration {
    Duration::seconds(30)
}

// ============================================================================
// Recording Handler
// ============================================================================

/// Task handler that records payloads and fails those starting with "poison"
#[derive(Default)]
#[allow(dead_code)]
pub struct RecordingHandler {
    seen: Mutex<Vec<String>>,
}

impl RecordingHandler {
    #[allow(dead_code)]
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskHandler for RecordingHandler {
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()> {
        let body = delivery.payload_str().unwrap_or_default().to_string();
        self.seen.lock().unwrap().push(body.clone());
        if body.starts_with("poison") {
            anyhow::bail!("cannot process {}", body);
        }
        Ok(())
    }
}
