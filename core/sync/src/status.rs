//! Per-entity sync state machine and the process-wide status snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use ledgerline_common::EntityId;
use ledgerline_model::EntityKind;

use crate::conflict::SyncConflict;

/// State machine for one managed entity instance.
///
/// `idle → queued → sending → {idle | conflicted | queued/error}`:
/// a confirmed send returns to idle; a failed send returns to queued while
/// retries remain, else lands in error (manual intervention); conflicted
/// returns to idle only after its conflict resolves and reapplies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityState {
    Idle,
    Queued,
    Sending,
    Conflicted,
    Error,
}

/// Sync bookkeeping for a single entity instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityEntry {
    pub kind: EntityKind,
    pub entity_id: EntityId,
    pub state: EntityState,
    /// Last server version observed for this entity.
    pub remote_version: u64,
    pub last_synced: Option<DateTime<Utc>>,
    pub failure_count: u32,
    pub last_error: Option<String>,
}

impl EntityEntry {
    pub fn new(kind: EntityKind, entity_id: EntityId) -> Self {
        Self {
            kind,
            entity_id,
            state: EntityState::Idle,
            remote_version: 0,
            last_synced: None,
            failure_count: 0,
            last_error: None,
        }
    }

    /// A local operation was queued.
    pub fn mark_queued(&mut self) {
        self.state = EntityState::Queued;
    }

    /// Dispatch started.
    pub fn mark_sending(&mut self) {
        self.state = EntityState::Sending;
    }

    /// The remote store accepted the operation at `version`.
    pub fn mark_confirmed(&mut self, version: u64) {
        self.state = EntityState::Idle;
        self.remote_version = version;
        self.last_synced = Some(Utc::now());
        self.failure_count = 0;
        self.last_error = None;
    }

    /// Dispatch failed; back to queued while retries remain, else error.
    pub fn mark_failed(&mut self, error: impl Into<String>, retries_remain: bool) {
        self.failure_count += 1;
        self.last_error = Some(error.into());
        self.state = if retries_remain {
            EntityState::Queued
        } else {
            EntityState::Error
        };
    }

    /// A conflict was detected for this entity.
    pub fn mark_conflicted(&mut self) {
        self.state = EntityState::Conflicted;
    }

    /// A remote change was applied directly (no local pending operation).
    pub fn observe_remote(&mut self, version: u64) {
        self.remote_version = version;
        if self.state == EntityState::Conflicted {
            return;
        }
        if self.state == EntityState::Idle || self.state == EntityState::Error {
            self.last_synced = Some(Utc::now());
        }
    }
}

/// Registry of per-entity sync entries.
#[derive(Debug, Clone, Default)]
pub struct SyncState {
    entries: HashMap<(EntityKind, EntityId), EntityEntry>,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: EntityKind, id: &EntityId) -> Option<&EntityEntry> {
        self.entries.get(&(kind, id.clone()))
    }

    /// Entry for an entity, created idle on first touch.
    pub fn entry(&mut self, kind: EntityKind, id: &EntityId) -> &mut EntityEntry {
        self.entries
            .entry((kind, id.clone()))
            .or_insert_with(|| EntityEntry::new(kind, id.clone()))
    }

    pub fn remove(&mut self, kind: EntityKind, id: &EntityId) -> Option<EntityEntry> {
        self.entries.remove(&(kind, id.clone()))
    }

    pub fn is_conflicted(&self, kind: EntityKind, id: &EntityId) -> bool {
        self.get(kind, id)
            .map_or(false, |e| e.state == EntityState::Conflicted)
    }

    pub fn entries(&self) -> impl Iterator<Item = &EntityEntry> {
        self.entries.values()
    }

    /// Count entries by state.
    pub fn count_by_state(&self) -> HashMap<EntityState, usize> {
        let mut counts = HashMap::new();
        for entry in self.entries.values() {
            *counts.entry(entry.state).or_insert(0) += 1;
        }
        counts
    }
}

/// Process-wide sync status, owned and mutated only by the coordinator.
#[derive(Debug, Clone, Default)]
pub struct SyncStatus {
    pub is_connected: bool,
    pub is_syncing: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Queued or in-flight operations.
    pub pending_operations: usize,
    /// Unresolved conflicts awaiting `resolve_conflict`.
    pub conflicts: Vec<SyncConflict>,
    /// Last terminal failure; sticks until a retry or dismissal.
    pub error: Option<String>,
}
