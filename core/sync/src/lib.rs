//! Ledgerline Sync Engine
//!
//! This module keeps a local, offline-capable copy of shared financial
//! records consistent with a remote store that other devices mutate
//! concurrently. It provides:
//! - A durable, per-entity-ordered offline operation queue
//! - Field-level conflict analysis with confidence scoring
//! - A coordinator for outbound delivery, inbound change application,
//!   and the conflict lifecycle
//! - Retry strategy with exponential backoff
//! - A broadcast event bus for status consumers

pub mod adapter;
pub mod analyzer;
pub mod conflict;
pub mod coordinator;
pub mod events;
pub mod queue;
pub mod retry;
pub mod status;

// Re-export main types
pub use adapter::{is_syncable, ActionKind, StoreAction, StoreAdapter};
pub use analyzer::{AnalyzerConfig, ConflictAnalysis, ConflictAnalyzer, Severity, SuggestedResolution};
pub use conflict::{Resolution, SyncConflict};
pub use coordinator::{DrainSummary, SyncConfig, SyncCoordinator};
pub use events::{AppliedChange, EventBus, SyncEvent};
pub use queue::{FailureOutcome, OfflineQueue, QueueItem, QueueItemStatus};
pub use retry::{RetryConfig, RetryExecutor};
pub use status::{EntityState, SyncState, SyncStatus};
