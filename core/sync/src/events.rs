//! Broadcast event bus for sync status consumers.
//!
//! Subscribers get immutable event clones. Delivery is in publish order,
//! which the coordinator keeps per-entity consistent; no ordering is
//! promised across entities.

use tokio::sync::broadcast;
use tracing::trace;

use ledgerline_common::EntityId;
use ledgerline_model::{EntityKind, FieldMap, SyncOperation};

use crate::conflict::{Resolution, SyncConflict};

/// What kind of inbound change was applied to local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliedChange {
    Create,
    Update,
    Delete,
    Merge,
}

/// Events published by the coordinator.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    SyncStarted,
    SyncCompleted {
        synced: usize,
        failed: usize,
        conflicts: usize,
    },
    /// Non-retryable failure or exhausted retries; the operation stays
    /// queryable in the queue.
    SyncFailed {
        operation: SyncOperation,
        error: String,
    },
    ConflictDetected {
        conflict: SyncConflict,
    },
    ConflictAutoResolved {
        conflict_id: String,
        kind: EntityKind,
        entity_id: EntityId,
        resolution: Resolution,
    },
    ConflictResolved {
        conflict_id: String,
        kind: EntityKind,
        entity_id: EntityId,
        resolution: Resolution,
    },
    /// An inbound (or merged) change was applied to the local collection.
    RemoteApplied {
        kind: EntityKind,
        entity_id: EntityId,
        change: AppliedChange,
        /// Post-change snapshot; None for deletes.
        data: Option<FieldMap>,
    },
}

impl SyncEvent {
    /// Stable event name, the vocabulary consumers filter on.
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::Connected => "connected",
            SyncEvent::Disconnected => "disconnected",
            SyncEvent::SyncStarted => "sync-start",
            SyncEvent::SyncCompleted { .. } => "sync-complete",
            SyncEvent::SyncFailed { .. } => "sync-failed",
            SyncEvent::ConflictDetected { .. } => "conflict-detected",
            SyncEvent::ConflictAutoResolved { .. } => "conflict-auto-resolved",
            SyncEvent::ConflictResolved { .. } => "conflict-resolved",
            SyncEvent::RemoteApplied { change, .. } => match change {
                AppliedChange::Create => "remote-create",
                AppliedChange::Update => "remote-update",
                AppliedChange::Delete => "remote-delete",
                AppliedChange::Merge => "remote-merge",
            },
        }
    }
}

/// Process-wide publish/subscribe channel for sync events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per lagging subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe; dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Events published with no subscribers are dropped.
    pub fn emit(&self, event: SyncEvent) {
        trace!("emit {}", event.name());
        let _ = self.tx.send(event);
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        assert_eq!(SyncEvent::Connected.name(), "connected");
        assert_eq!(SyncEvent::SyncStarted.name(), "sync-start");
        let applied = SyncEvent::RemoteApplied {
            kind: EntityKind::Goal,
            entity_id: EntityId::new("g1").unwrap(),
            change: AppliedChange::Merge,
            data: None,
        };
        assert_eq!(applied.name(), "remote-merge");
    }

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(SyncEvent::SyncStarted);
        bus.emit(SyncEvent::SyncCompleted {
            synced: 1,
            failed: 0,
            conflicts: 0,
        });

        assert_eq!(rx.recv().await.unwrap().name(), "sync-start");
        assert_eq!(rx.recv().await.unwrap().name(), "sync-complete");
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.emit(SyncEvent::Disconnected);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
