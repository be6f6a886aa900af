//! Detected conflicts and their resolutions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ledgerline_common::EntityId;
use ledgerline_model::{EntityKind, SyncOperation};

use crate::analyzer::ConflictAnalysis;

/// How a conflict gets resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Keep the local operation; overwrite the server.
    Local,
    /// Discard the local operation; apply the server value.
    Remote,
    /// Apply merged data locally and to the server.
    Merge,
}

/// A pair of divergent operations against the same entity.
///
/// Created when a pending local operation and a remote state for the same
/// `(kind, entity_id)` disagree. Destroyed once a resolution is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Unique conflict id.
    pub id: String,
    /// The not-yet-accepted local operation.
    pub local: SyncOperation,
    /// The server's state, wrapped as an operation for comparison.
    pub remote: SyncOperation,
    /// Analyzer output for this pair.
    pub analysis: ConflictAnalysis,
    /// When the conflict was detected.
    pub detected_at: DateTime<Utc>,
}

impl SyncConflict {
    /// Wrap a divergent local/remote operation pair.
    ///
    /// Both operations must target the same entity.
    pub fn new(local: SyncOperation, remote: SyncOperation, analysis: ConflictAnalysis) -> Self {
        debug_assert_eq!(local.kind, remote.kind);
        debug_assert_eq!(local.entity_id, remote.entity_id);
        Self {
            id: Uuid::new_v4().to_string(),
            local,
            remote,
            analysis,
            detected_at: Utc::now(),
        }
    }

    /// The entity this conflict is about.
    pub fn key(&self) -> (EntityKind, EntityId) {
        (self.local.kind, self.local.entity_id.clone())
    }
}
