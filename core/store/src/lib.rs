//! Storage collaborators for Ledgerline sync.
//!
//! `remote` defines the boundary to the shared remote store (optimistic
//! concurrency + change feed); `memory` is an in-process implementation for
//! tests and development; `snapshot` persists last-known local collection
//! state across restarts.

pub mod memory;
pub mod remote;
pub mod snapshot;

pub use memory::MemoryStore;
pub use remote::{ChangeFeed, RemoteChange, RemoteRecord, RemoteStore, UpsertOutcome};
pub use snapshot::SnapshotStore;
