//! Durable offline operation queue.
//!
//! Operations queue here until the coordinator delivers them. The journal is
//! persisted after every mutation so queued work survives restarts; offline
//! periods of any length only grow the journal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use ledgerline_common::{EntityId, Error, Result};
use ledgerline_model::{EntityKind, OperationType, SyncOperation};

use crate::retry::RetryConfig;

/// Lifecycle status of a queued item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    /// Waiting for dispatch (or for its backoff gate to open).
    Pending,
    /// Dispatch in flight.
    Syncing,
    /// Retries exhausted or rejected; retained for inspection/manual retry.
    Failed,
}

/// A queued operation plus its delivery bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    /// Queue item id (distinct from the operation id).
    pub id: String,
    pub operation: SyncOperation,
    pub status: QueueItemStatus,
    pub retries: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    /// Backoff gate; the item is not dispatchable before this instant.
    pub not_before: Option<DateTime<Utc>>,
    /// Monotonic enqueue order, preserved across restarts.
    pub seq: u64,
}

impl QueueItem {
    fn entity_key(&self) -> (EntityKind, &EntityId) {
        (self.operation.kind, &self.operation.entity_id)
    }

    fn ready_at(&self, now: DateTime<Utc>) -> bool {
        self.status == QueueItemStatus::Pending && self.not_before.map_or(true, |t| t <= now)
    }
}

/// What `mark_failed` decided for an item.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Back to pending; dispatchable again after `delay`.
    WillRetry { delay: Duration },
    /// Retries exhausted; the item is now terminal `Failed`.
    Exhausted,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Journal {
    next_seq: u64,
    items: Vec<QueueItem>,
}

/// Durable, per-entity-ordered operation queue.
pub struct OfflineQueue {
    items: HashMap<String, QueueItem>,
    next_seq: u64,
    journal_path: PathBuf,
    max_retries: u32,
    backoff: RetryConfig,
}

impl OfflineQueue {
    /// Open (or create) a queue journaled under `base_dir`.
    ///
    /// Items left `syncing` by a crash are demoted back to `pending` with
    /// their sequence order intact.
    pub async fn open(
        base_dir: impl AsRef<Path>,
        max_retries: u32,
        backoff: RetryConfig,
    ) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).await.map_err(Error::Io)?;
        let journal_path = base_dir.join("queue_journal.json");

        let journal: Journal = if journal_path.exists() {
            let content = fs::read_to_string(&journal_path)
                .await
                .map_err(Error::Io)?;
            serde_json::from_str(&content).unwrap_or_default()
        } else {
            Journal::default()
        };

        let mut items = HashMap::new();
        for mut item in journal.items {
            if item.status == QueueItemStatus::Syncing {
                debug!(
                    "Recovering in-flight item {} for {}/{}",
                    item.id,
                    item.operation.kind,
                    item.operation.entity_id
                );
                item.status = QueueItemStatus::Pending;
            }
            items.insert(item.id.clone(), item);
        }

        Ok(Self {
            items,
            next_seq: journal.next_seq,
            journal_path,
            max_retries,
            backoff,
        })
    }

    /// Append an operation.
    ///
    /// An UPDATE coalesces into an existing pending CREATE/UPDATE for the
    /// same entity (latest-wins per field) instead of creating a second
    /// round trip. Coalescing never crosses a DELETE: a DELETE flushes all
    /// pending items for its entity and becomes the sole survivor, and
    /// nothing coalesces into a pending DELETE. Items already in flight are
    /// never touched.
    pub async fn enqueue(&mut self, op: SyncOperation) -> Result<QueueItem> {
        match op.op {
            OperationType::Update => {
                let target = self
                    .items
                    .values_mut()
                    .filter(|i| {
                        i.entity_key() == (op.kind, &op.entity_id)
                            && i.status == QueueItemStatus::Pending
                            && i.operation.op != OperationType::Delete
                    })
                    .max_by_key(|i| i.seq);

                if let Some(item) = target {
                    for (k, v) in &op.data {
                        item.operation.data.insert(k.clone(), v.clone());
                    }
                    item.operation.timestamp = op.timestamp;
                    let coalesced = item.clone();
                    debug!(
                        "Coalesced update into item {} for {}/{}",
                        coalesced.id, op.kind, op.entity_id
                    );
                    self.persist().await?;
                    return Ok(coalesced);
                }
            }
            OperationType::Delete => {
                let flushed: Vec<String> = self
                    .items
                    .values()
                    .filter(|i| {
                        i.entity_key() == (op.kind, &op.entity_id)
                            && i.status == QueueItemStatus::Pending
                    })
                    .map(|i| i.id.clone())
                    .collect();
                for id in &flushed {
                    self.items.remove(id);
                }
                if !flushed.is_empty() {
                    debug!(
                        "Delete flushed {} queued item(s) for {}/{}",
                        flushed.len(),
                        op.kind,
                        op.entity_id
                    );
                }
            }
            OperationType::Create => {}
        }

        let item = QueueItem {
            id: Uuid::new_v4().to_string(),
            operation: op,
            status: QueueItemStatus::Pending,
            retries: 0,
            max_retries: self.max_retries,
            last_error: None,
            enqueued_at: Utc::now(),
            not_before: None,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.items.insert(item.id.clone(), item.clone());
        self.persist().await?;
        Ok(item)
    }

    /// Take the next dispatchable item, marking it `syncing`.
    ///
    /// FIFO per entity: an item is only dispatchable when no earlier item
    /// for the same entity exists in any status (an in-flight item blocks
    /// its successors; a terminal failed item holds the line until it is
    /// retried or removed). Ordering across entities is unspecified.
    pub async fn dequeue_next(&mut self) -> Result<Option<QueueItem>> {
        let now = Utc::now();
        let candidate = self
            .items
            .values()
            .filter(|i| i.ready_at(now))
            .filter(|i| {
                !self
                    .items
                    .values()
                    .any(|other| other.entity_key() == i.entity_key() && other.seq < i.seq)
            })
            .min_by_key(|i| i.seq)
            .map(|i| i.id.clone());

        let Some(id) = candidate else {
            return Ok(None);
        };
        let item = self.items.get_mut(&id).expect("candidate id exists");
        item.status = QueueItemStatus::Syncing;
        let snapshot = item.clone();
        self.persist().await?;
        Ok(Some(snapshot))
    }

    /// Remove an item after remote acceptance.
    pub async fn mark_succeeded(&mut self, item_id: &str) -> Result<()> {
        self.items
            .remove(item_id)
            .ok_or_else(|| Error::NotFound(format!("Queue item not found: {}", item_id)))?;
        self.persist().await
    }

    /// Record a transient failure.
    ///
    /// Returns to `pending` behind an exponential backoff gate while retries
    /// remain; otherwise the item becomes terminal `failed` and stays in the
    /// journal for inspection.
    pub async fn mark_failed(&mut self, item_id: &str, error: &str) -> Result<FailureOutcome> {
        let max_retries = self.max_retries;
        let item = self
            .items
            .get_mut(item_id)
            .ok_or_else(|| Error::NotFound(format!("Queue item not found: {}", item_id)))?;

        item.last_error = Some(error.to_string());
        let outcome = if item.retries < max_retries {
            let delay = self.backoff.delay_for_attempt(item.retries);
            item.retries += 1;
            item.status = QueueItemStatus::Pending;
            item.not_before = Some(
                Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60)),
            );
            FailureOutcome::WillRetry { delay }
        } else {
            warn!(
                "Item {} exhausted {} retries: {}",
                item_id, max_retries, error
            );
            item.status = QueueItemStatus::Failed;
            FailureOutcome::Exhausted
        };
        self.persist().await?;
        Ok(outcome)
    }

    /// Mark an item terminally failed without consuming retries
    /// (validation/server rejection).
    pub async fn mark_rejected(&mut self, item_id: &str, error: &str) -> Result<()> {
        let item = self
            .items
            .get_mut(item_id)
            .ok_or_else(|| Error::NotFound(format!("Queue item not found: {}", item_id)))?;
        item.last_error = Some(error.to_string());
        item.status = QueueItemStatus::Failed;
        self.persist().await
    }

    /// Reset a terminal failed item back to pending (manual retry).
    pub async fn retry_failed(&mut self, item_id: &str) -> Result<()> {
        let item = self
            .items
            .get_mut(item_id)
            .ok_or_else(|| Error::NotFound(format!("Queue item not found: {}", item_id)))?;
        if item.status != QueueItemStatus::Failed {
            return Err(Error::InvalidInput(format!(
                "Queue item {} is not failed",
                item_id
            )));
        }
        item.status = QueueItemStatus::Pending;
        item.retries = 0;
        item.not_before = None;
        self.persist().await
    }

    /// Pull an entity's settled items out of the queue (conflict folding),
    /// in sequence order. An item currently in flight stays put: its
    /// submission outcome, not the fold, decides what happens to it.
    pub async fn take_entity(
        &mut self,
        kind: EntityKind,
        entity_id: &EntityId,
    ) -> Result<Vec<QueueItem>> {
        let mut taken: Vec<QueueItem> = self
            .items
            .values()
            .filter(|i| {
                i.entity_key() == (kind, entity_id) && i.status != QueueItemStatus::Syncing
            })
            .cloned()
            .collect();
        taken.sort_by_key(|i| i.seq);
        for item in &taken {
            self.items.remove(&item.id);
        }
        if !taken.is_empty() {
            self.persist().await?;
        }
        Ok(taken)
    }

    /// Whether a submission for this entity is currently in flight.
    pub fn has_in_flight(&self, kind: EntityKind, entity_id: &EntityId) -> bool {
        self.items
            .values()
            .any(|i| i.entity_key() == (kind, entity_id) && i.status == QueueItemStatus::Syncing)
    }

    /// Items for one entity, in sequence order.
    pub fn items_for_entity(&self, kind: EntityKind, entity_id: &EntityId) -> Vec<&QueueItem> {
        let mut items: Vec<&QueueItem> = self
            .items
            .values()
            .filter(|i| i.entity_key() == (kind, entity_id))
            .collect();
        items.sort_by_key(|i| i.seq);
        items
    }

    /// Terminal failed items, oldest first.
    pub fn failed_items(&self) -> Vec<&QueueItem> {
        let mut items: Vec<&QueueItem> = self
            .items
            .values()
            .filter(|i| i.status == QueueItemStatus::Failed)
            .collect();
        items.sort_by_key(|i| i.seq);
        items
    }

    /// Count of items still awaiting delivery (pending or in flight).
    pub fn pending_count(&self) -> usize {
        self.items
            .values()
            .filter(|i| i.status != QueueItemStatus::Failed)
            .count()
    }

    /// Total items, including terminal failures.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    async fn persist(&self) -> Result<()> {
        let mut items: Vec<&QueueItem> = self.items.values().collect();
        items.sort_by_key(|i| i.seq);
        let journal = serde_json::json!({
            "next_seq": self.next_seq,
            "items": items,
        });
        let json = serde_json::to_string_pretty(&journal)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        fs::write(&self.journal_path, json)
            .await
            .map_err(Error::Io)
    }
}
