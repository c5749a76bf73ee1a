//! # Lease Queue
//!
//! At-least-once task queue with visibility-timeout leasing, retry with
//! exponential backoff and poison-message quarantine.
//!
//! This library provides:
//! - Durable entry storage behind a single compare-and-transition primitive
//! - Token-authenticated leases that expire by clock comparison
//! - Retry policy deciding between backoff and quarantine
//! - Operator actions on quarantined entries
//! - A background reaper and a heart-beating worker loop
//!
//! ## Module Organization
//!
//! - [`entry`] - Entry record, identifiers and transition primitives
//! - [`error`] - Error types for all queue operations
//! - [`clock`] - Time sources
//! - [`store`] - Storage trait plus in-memory and file-backed stores
//! - [`lease`] - Lease grant, renewal, release and reclamation
//! - [`retry`] - Backoff and quarantine decisions
//! - [`service`] - Producer, consumer and operator operations
//! - [`reaper`] - Periodic reclamation of expired leases
//! - [`worker`] - Queue-triggered task processing
//! - [`config`] - Queue and worker configuration

pub mod clock;
pub mod config;
pub mod entry;
pub mod error;
pub mod lease;
pub mod reaper;
pub mod retry;
pub mod service;
pub mod store;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{QueueConfig, StorageConfig, WorkerConfig};
pub use entry::{Delivery, Entry, EntryId, EntryState, LeaseToken, Timestamp};
pub use error::{ConfigurationError, QueueError, ValidationError};
pub use lease::{Disposition, LeaseManager, ReleaseOutcome};
pub use reaper::Reaper;
pub use retry::{RetryAction, RetryPolicy};
pub use service::QueueService;
pub use store::{open_store, FileMessageStore, InMemoryMessageStore, MessageStore, StateCounts};
pub use worker::{LoggingHandler, TaskHandler, Worker, WorkerStats};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
