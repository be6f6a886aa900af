//! The operation envelope: one intended mutation against one entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ledgerline_common::{EntityId, OriginId};

use crate::entity::{EntityKind, FieldMap};

/// Kind of mutation an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

/// A single intended create/update/delete against one entity instance.
///
/// Immutable once created. Produced by the store adapter when a local
/// mutation happens, or synthesized from a change-feed entry on the inbound
/// path. Consumed when the coordinator confirms remote acceptance, exhausts
/// retries, or folds it into a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    /// Unique id for this operation.
    pub id: String,
    /// Mutation type.
    pub op: OperationType,
    /// Which collection the entity belongs to.
    pub kind: EntityKind,
    /// The entity instance being mutated.
    pub entity_id: EntityId,
    /// Full field snapshot after the mutation (empty for deletes).
    pub data: FieldMap,
    /// When the mutation was produced.
    pub timestamp: DateTime<Utc>,
    /// Device/session that produced it.
    pub origin: OriginId,
    /// Base version of the entity this mutation was made against.
    pub version: u64,
}

impl SyncOperation {
    /// Create a new locally-originated operation stamped with the current time.
    pub fn new(
        op: OperationType,
        kind: EntityKind,
        entity_id: EntityId,
        data: FieldMap,
        origin: OriginId,
        version: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            op,
            kind,
            entity_id,
            data,
            timestamp: Utc::now(),
            origin,
            version,
        }
    }

    /// Create an operation representing a remote-side state, timestamped by
    /// the server rather than by us.
    pub fn remote(
        op: OperationType,
        kind: EntityKind,
        entity_id: EntityId,
        data: FieldMap,
        timestamp: DateTime<Utc>,
        origin: OriginId,
        version: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            op,
            kind,
            entity_id,
            data,
            timestamp,
            origin,
            version,
        }
    }

    /// Whether this operation is a delete.
    pub fn is_delete(&self) -> bool {
        self.op == OperationType::Delete
    }
}
