//! # Stride Sync Core
//!
//! Offline-first synchronization core for the Stride fitness-program
//! tracker.
//!
//! The mobile client performs mutations optimistically; this crate is
//! the part that reasons about partial failure, ordering, idempotence
//! and merge semantics:
//!
//! - **Retry**: single-operation execution with exponential backoff,
//!   jitter and keyed deduplication
//! - **Queue**: durable, priority-ordered buffering of mutations plus
//!   autonomous draining when connectivity allows
//! - **Conflict**: pluggable, priority-ranked strategies that reconcile
//!   divergent local/remote snapshots of one logical record
//!
//! ## Architecture
//!
//! ```text
//! caller ──mutation──► remote ──failure──► OfflineQueue ──drain──► RetryExecutor
//!                                               │
//! caller ──local/remote divergence──► ConflictEngine ──► one winning value
//! ```
//!
//! View rendering, routing and authentication live elsewhere. This crate
//! consumes a durable key-value store, a connectivity signal and
//! per-kind delivery functions supplied by the host application, and
//! pushes [`queue::SyncStatus`] snapshots to whoever subscribes.
//!
//! Construct one [`queue::OfflineQueue`] and one
//! [`conflict::ConflictEngine`] at application start and pass them by
//! reference; there is no hidden global state.

pub mod connectivity;
pub mod conflict;
pub mod error;
pub mod queue;
pub mod retry;
pub mod storage;
pub mod types;

pub use connectivity::Connectivity;
pub use conflict::{
    BatchStrategy, ConflictCase, ConflictEngine, Resolution, ResolutionStrategy, Resolver,
    UserChoice,
};
pub use error::{Result, SyncError};
pub use queue::{
    OfflineQueue, OfflineQueueConfig, PendingOperation, SyncFailure, SyncStatus, DEFAULT_PRIORITY,
};
pub use retry::{RetryExecutor, RetryOutcome, RetryPolicy};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
pub use types::{EntityKind, OperationKind};
