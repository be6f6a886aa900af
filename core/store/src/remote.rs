//! Remote store trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use ledgerline_common::{EntityId, OriginId, Result};
use ledgerline_model::{EntityKind, FieldMap, OperationType, SyncOperation};

/// The current server-side state of one entity row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Which collection the row belongs to.
    pub kind: EntityKind,
    /// Row id.
    pub id: EntityId,
    /// Full field snapshot.
    pub data: FieldMap,
    /// Server version, incremented on every accepted write.
    pub version: u64,
    /// Server timestamp of the last accepted write.
    pub updated_at: DateTime<Utc>,
    /// Origin of the last accepted write.
    pub origin: OriginId,
}

/// One entry from a collection's change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChange {
    pub kind: EntityKind,
    pub id: EntityId,
    /// What happened to the row.
    pub op: OperationType,
    /// Row state after the change (None for deletes).
    pub record: Option<RemoteRecord>,
    /// Origin of the write that produced this change.
    pub origin: OriginId,
    /// Server timestamp of the change.
    pub at: DateTime<Utc>,
}

/// Result of an optimistic-concurrency write.
///
/// A version mismatch is not an error: it is the signal that routes the
/// operation to the conflict analyzer.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    /// Write accepted; the new row state.
    Applied(RemoteRecord),
    /// Someone else changed the row since the base version was read.
    /// `current` is None when the row was deleted remotely.
    VersionMismatch { current: Option<RemoteRecord> },
}

/// Change-feed subscription handle. Dropping the receiver unsubscribes.
pub type ChangeFeed = broadcast::Receiver<RemoteChange>;

/// Remote store boundary for different backends.
///
/// All operations are async. Implementations must enforce optimistic
/// concurrency: a write carries the base version the caller last read, and
/// is rejected (as data, not as an error) when the row has moved past it.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Get the backend name (e.g., "memory", "http").
    fn name(&self) -> &str;

    /// Fetch the current state of one row, if it exists.
    async fn fetch(&self, kind: EntityKind, id: &EntityId) -> Result<Option<RemoteRecord>>;

    /// List all rows of a collection.
    async fn list(&self, kind: EntityKind) -> Result<Vec<RemoteRecord>>;

    /// Create or update a row.
    ///
    /// # Preconditions
    /// - `op.op` is Create or Update
    /// - for Create, `op.version` is 0 and the row must not exist
    /// - for Update, `op.version` must equal the row's current version
    ///
    /// # Postconditions
    /// - on `Applied`, the row holds `op.data` at `version + 1` and the
    ///   change feed carries a matching entry
    ///
    /// # Errors
    /// - Network/timeout failures (transient)
    /// - `Rejected` for payloads the server refuses outright
    async fn upsert(&self, op: &SyncOperation) -> Result<UpsertOutcome>;

    /// Delete a row, subject to the same version check as `upsert`.
    ///
    /// On success, `Applied` carries the row state that was removed.
    /// Deleting a row that no longer exists reports
    /// `VersionMismatch { current: None }`; callers that only wanted the row
    /// gone may treat that as confirmation.
    async fn delete(&self, op: &SyncOperation) -> Result<UpsertOutcome>;

    /// Subscribe to the change feed for one collection.
    fn subscribe(&self, kind: EntityKind) -> ChangeFeed;
}
