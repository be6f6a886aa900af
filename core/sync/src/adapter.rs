//! Bridge between a host state container and the sync engine.
//!
//! The adapter owns the local in-memory collections. Local mutations apply
//! optimistically and enqueue an operation; inbound sync events fold back
//! into the collections and are snapshotted to disk so a restart resumes
//! from the last observed state.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use ledgerline_common::{EntityId, Result};
use ledgerline_model::{
    fields_of, Account, Budget, EntityKind, FieldMap, Goal, OperationType, SyncOperation,
    Transaction,
};
use ledgerline_store::{RemoteStore, SnapshotStore};

use crate::coordinator::SyncCoordinator;
use crate::events::SyncEvent;

/// Kind of state-container action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Create,
    Update,
    Delete,
    /// Hydration from a fetch/bootstrap; already server state.
    BulkLoad,
}

/// Actions that must never re-enter the queue.
pub const IGNORED_ACTIONS: [ActionKind; 1] = [ActionKind::BulkLoad];

/// Whether an action represents a user mutation that needs syncing.
pub fn is_syncable(kind: ActionKind) -> bool {
    !IGNORED_ACTIONS.contains(&kind)
}

/// A state-container action dispatched by the host application.
#[derive(Debug, Clone)]
pub enum StoreAction {
    Create {
        kind: EntityKind,
        id: EntityId,
        data: FieldMap,
    },
    Update {
        kind: EntityKind,
        id: EntityId,
        data: FieldMap,
    },
    Delete {
        kind: EntityKind,
        id: EntityId,
    },
    BulkLoad {
        kind: EntityKind,
        rows: HashMap<EntityId, FieldMap>,
    },
}

impl StoreAction {
    pub fn action_kind(&self) -> ActionKind {
        match self {
            StoreAction::Create { .. } => ActionKind::Create,
            StoreAction::Update { .. } => ActionKind::Update,
            StoreAction::Delete { .. } => ActionKind::Delete,
            StoreAction::BulkLoad { .. } => ActionKind::BulkLoad,
        }
    }
}

/// Adapter wiring the host's collections to the coordinator.
pub struct StoreAdapter<R: RemoteStore + ?Sized> {
    coordinator: Arc<SyncCoordinator<R>>,
    collections: RwLock<HashMap<EntityKind, HashMap<EntityId, FieldMap>>>,
    snapshots: SnapshotStore,
}

impl<R: RemoteStore + ?Sized> StoreAdapter<R> {
    /// Create an adapter, restoring collections from their snapshots.
    pub async fn new(
        coordinator: Arc<SyncCoordinator<R>>,
        data_dir: impl AsRef<std::path::Path>,
    ) -> Result<Self> {
        let snapshots = SnapshotStore::new(data_dir).await?;
        let mut collections = HashMap::new();
        for kind in EntityKind::ALL {
            let rows = snapshots.load(kind).await?;
            if !rows.is_empty() {
                debug!("Restored {} rows for {}", rows.len(), kind);
            }
            collections.insert(kind, rows);
        }
        Ok(Self {
            coordinator,
            collections: RwLock::new(collections),
            snapshots,
        })
    }

    /// Apply a state-container action.
    ///
    /// Mutations apply to the local collection immediately (optimistic) and
    /// enqueue an operation for delivery. Bulk loads only replace the local
    /// collection: they are already server state and never re-enter the
    /// queue.
    pub async fn dispatch(&self, action: StoreAction) -> Result<()> {
        if !is_syncable(action.action_kind()) {
            let StoreAction::BulkLoad { kind, rows } = action else {
                return Ok(());
            };
            debug!("Bulk load of {} rows into {}", rows.len(), kind);
            self.collections.write().await.insert(kind, rows);
            self.snapshot(kind).await?;
            return Ok(());
        }

        let (op_type, kind, id, data) = match action {
            StoreAction::Create { kind, id, data } => (OperationType::Create, kind, id, data),
            StoreAction::Update { kind, id, data } => (OperationType::Update, kind, id, data),
            StoreAction::Delete { kind, id } => {
                (OperationType::Delete, kind, id, FieldMap::new())
            }
            StoreAction::BulkLoad { .. } => unreachable!("filtered above"),
        };

        {
            let mut collections = self.collections.write().await;
            let collection = collections.entry(kind).or_default();
            if op_type == OperationType::Delete {
                collection.remove(&id);
            } else {
                collection.insert(id.clone(), data.clone());
            }
        }
        self.snapshot(kind).await?;

        let version = self.coordinator.known_version(kind, &id).await;
        let op = SyncOperation::new(
            op_type,
            kind,
            id,
            data,
            self.coordinator.origin().clone(),
            version,
        );
        self.coordinator.enqueue_local(op).await?;
        Ok(())
    }

    /// Fold a sync event back into the collections.
    ///
    /// Only `RemoteApplied` events carry data changes; everything else is
    /// status and passes through untouched. Applying the same event twice is
    /// harmless.
    pub async fn apply_event(&self, event: &SyncEvent) -> Result<()> {
        let SyncEvent::RemoteApplied {
            kind,
            entity_id,
            data,
            ..
        } = event
        else {
            return Ok(());
        };

        {
            let mut collections = self.collections.write().await;
            let collection = collections.entry(*kind).or_default();
            match data {
                Some(data) => {
                    collection.insert(entity_id.clone(), data.clone());
                }
                None => {
                    collection.remove(entity_id);
                }
            }
        }
        self.snapshot(*kind).await
    }

    /// Hydrate every collection from the remote store.
    pub async fn bootstrap(&self) -> Result<()> {
        for kind in EntityKind::ALL {
            let records = self.coordinator.load_remote(kind).await?;
            let rows: HashMap<EntityId, FieldMap> = records
                .into_iter()
                .map(|r| (r.id, r.data))
                .collect();
            self.dispatch(StoreAction::BulkLoad { kind, rows }).await?;
        }
        Ok(())
    }

    /// Spawn a task folding coordinator events into the collections until
    /// the event bus closes.
    pub fn listen(self: &Arc<Self>) -> tokio::task::JoinHandle<()>
    where
        R: 'static,
    {
        let adapter = self.clone();
        let mut rx = adapter.coordinator.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Err(e) = adapter.apply_event(&event).await {
                            warn!("Failed to apply sync event: {}", e);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Sync event stream lagged by {}", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// One row, if present locally.
    pub async fn get(&self, kind: EntityKind, id: &EntityId) -> Option<FieldMap> {
        self.collections
            .read()
            .await
            .get(&kind)
            .and_then(|c| c.get(id))
            .cloned()
    }

    /// Snapshot of a whole collection.
    pub async fn collection(&self, kind: EntityKind) -> HashMap<EntityId, FieldMap> {
        self.collections
            .read()
            .await
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    /// Typed convenience: create or update an account.
    pub async fn upsert_account(&self, account: &Account) -> Result<()> {
        self.upsert_typed(EntityKind::Account, &account.id, account)
            .await
    }

    /// Typed convenience: create or update a transaction.
    pub async fn upsert_transaction(&self, tx: &Transaction) -> Result<()> {
        self.upsert_typed(EntityKind::Transaction, &tx.id, tx).await
    }

    /// Typed convenience: create or update a budget.
    pub async fn upsert_budget(&self, budget: &Budget) -> Result<()> {
        self.upsert_typed(EntityKind::Budget, &budget.id, budget).await
    }

    /// Typed convenience: create or update a goal.
    pub async fn upsert_goal(&self, goal: &Goal) -> Result<()> {
        self.upsert_typed(EntityKind::Goal, &goal.id, goal).await
    }

    /// Typed convenience: delete a row.
    pub async fn delete(&self, kind: EntityKind, id: &EntityId) -> Result<()> {
        self.dispatch(StoreAction::Delete {
            kind,
            id: id.clone(),
        })
        .await
    }

    async fn upsert_typed<T: serde::Serialize>(
        &self,
        kind: EntityKind,
        id: &str,
        entity: &T,
    ) -> Result<()> {
        let id = EntityId::new(id)?;
        let data = fields_of(entity)?;
        let action = if self.get(kind, &id).await.is_some() {
            StoreAction::Update {
                kind,
                id,
                data,
            }
        } else {
            StoreAction::Create {
                kind,
                id,
                data,
            }
        };
        self.dispatch(action).await
    }

    async fn snapshot(&self, kind: EntityKind) -> Result<()> {
        let collections = self.collections.read().await;
        let collection = collections.get(&kind).cloned().unwrap_or_default();
        drop(collections);
        self.snapshots.save(kind, &collection).await.map_err(|e| {
            warn!("Snapshot write failed for {}: {}", kind, e);
            e
        })
    }
}
