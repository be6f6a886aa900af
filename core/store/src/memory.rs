//! In-memory remote store for testing.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;

use ledgerline_common::{EntityId, Error, Result};
use ledgerline_model::{EntityKind, OperationType, SyncOperation};

use crate::remote::{ChangeFeed, RemoteChange, RemoteRecord, RemoteStore, UpsertOutcome};

const FEED_CAPACITY: usize = 256;

/// In-memory remote store.
///
/// Useful for testing and development. Rows live in memory and are lost on
/// drop. Supports injecting transient failures to exercise retry paths.
pub struct MemoryStore {
    rows: Arc<RwLock<HashMap<(EntityKind, EntityId), RemoteRecord>>>,
    feeds: HashMap<EntityKind, broadcast::Sender<RemoteChange>>,
    fail_next: AtomicU32,
    latency_ms: AtomicU64,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        let mut feeds = HashMap::new();
        for kind in EntityKind::ALL {
            let (tx, _rx) = broadcast::channel(FEED_CAPACITY);
            feeds.insert(kind, tx);
        }
        Self {
            rows: Arc::new(RwLock::new(HashMap::new())),
            feeds,
            fail_next: AtomicU32::new(0),
            latency_ms: AtomicU64::new(0),
        }
    }

    /// Make the next `n` mutating calls fail with a network error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Delay every subsequent call by `latency`, simulating a slow link.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    async fn pause(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    /// Current version of a row, if present.
    pub fn version_of(&self, kind: EntityKind, id: &EntityId) -> Option<u64> {
        self.rows
            .read()
            .unwrap()
            .get(&(kind, id.clone()))
            .map(|r| r.version)
    }

    fn take_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n > 0 {
                    Some(n - 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    fn publish(&self, change: RemoteChange) {
        if let Some(tx) = self.feeds.get(&change.kind) {
            // No receivers is fine.
            let _ = tx.send(change);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn fetch(&self, kind: EntityKind, id: &EntityId) -> Result<Option<RemoteRecord>> {
        self.pause().await;
        if self.take_failure() {
            return Err(Error::Network("injected failure".to_string()));
        }
        Ok(self.rows.read().unwrap().get(&(kind, id.clone())).cloned())
    }

    async fn list(&self, kind: EntityKind) -> Result<Vec<RemoteRecord>> {
        self.pause().await;
        if self.take_failure() {
            return Err(Error::Network("injected failure".to_string()));
        }
        Ok(self
            .rows
            .read()
            .unwrap()
            .values()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect())
    }

    async fn upsert(&self, op: &SyncOperation) -> Result<UpsertOutcome> {
        if op.op == OperationType::Delete {
            return Err(Error::InvalidInput(
                "upsert called with a delete operation".to_string(),
            ));
        }
        self.pause().await;
        if self.take_failure() {
            return Err(Error::Network("injected failure".to_string()));
        }

        let key = (op.kind, op.entity_id.clone());
        let mut rows = self.rows.write().unwrap();

        let current_version = rows.get(&key).map(|r| r.version);
        match current_version {
            Some(v) if v != op.version => {
                return Ok(UpsertOutcome::VersionMismatch {
                    current: rows.get(&key).cloned(),
                });
            }
            None if op.op == OperationType::Update && op.version > 0 => {
                // Updating a row that was deleted remotely.
                return Ok(UpsertOutcome::VersionMismatch { current: None });
            }
            _ => {}
        }

        let record = RemoteRecord {
            kind: op.kind,
            id: op.entity_id.clone(),
            data: op.data.clone(),
            version: current_version.map_or(1, |v| v + 1),
            updated_at: Utc::now(),
            origin: op.origin.clone(),
        };
        rows.insert(key, record.clone());
        drop(rows);

        self.publish(RemoteChange {
            kind: record.kind,
            id: record.id.clone(),
            op: op.op,
            record: Some(record.clone()),
            origin: record.origin.clone(),
            at: record.updated_at,
        });

        Ok(UpsertOutcome::Applied(record))
    }

    async fn delete(&self, op: &SyncOperation) -> Result<UpsertOutcome> {
        self.pause().await;
        if self.take_failure() {
            return Err(Error::Network("injected failure".to_string()));
        }

        let key = (op.kind, op.entity_id.clone());
        let mut rows = self.rows.write().unwrap();

        match rows.get(&key) {
            None => Ok(UpsertOutcome::VersionMismatch { current: None }),
            Some(r) if r.version != op.version => Ok(UpsertOutcome::VersionMismatch {
                current: Some(r.clone()),
            }),
            Some(_) => {
                let removed = rows.remove(&key).expect("row checked above");
                drop(rows);

                self.publish(RemoteChange {
                    kind: op.kind,
                    id: op.entity_id.clone(),
                    op: OperationType::Delete,
                    record: None,
                    origin: op.origin.clone(),
                    at: Utc::now(),
                });

                Ok(UpsertOutcome::Applied(removed))
            }
        }
    }

    fn subscribe(&self, kind: EntityKind) -> ChangeFeed {
        self.feeds
            .get(&kind)
            .expect("feed exists for every kind")
            .subscribe()
    }
}
