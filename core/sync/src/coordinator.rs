//! Sync coordinator: outbound delivery, inbound application, conflict lifecycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use ledgerline_common::{EntityId, Error, OriginId, Result};
use ledgerline_model::{
    monetary_fields, EntityKind, FieldMap, OperationType, SyncOperation,
};
use ledgerline_store::{RemoteChange, RemoteRecord, RemoteStore, UpsertOutcome};

use crate::analyzer::{AnalyzerConfig, ConflictAnalyzer, SuggestedResolution};
use crate::conflict::{Resolution, SyncConflict};
use crate::events::{AppliedChange, EventBus, SyncEvent};
use crate::queue::{FailureOutcome, OfflineQueue, QueueItem};
use crate::retry::{RetryConfig, RetryExecutor};
use crate::status::{SyncState, SyncStatus};

/// Configuration for the sync coordinator.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Identity of this device/session, stamped on every operation.
    pub origin: OriginId,
    /// Maximum retries per queued operation.
    pub max_retries: u32,
    /// How often the run loop drains the queue.
    pub drain_interval: Duration,
    /// Per-submission network timeout; elapsing counts as a transient failure.
    pub submit_timeout: Duration,
    /// Whether safely-mergeable conflicts apply without user input.
    pub auto_resolve: bool,
    /// Analyzer policy (penalty per field, tie window).
    pub analyzer: AnalyzerConfig,
    /// Backoff policy shared by the queue gate and inbound fetch retries.
    pub backoff: RetryConfig,
    /// Event bus buffer per subscriber.
    pub event_capacity: usize,
}

impl SyncConfig {
    /// Defaults for a given origin.
    pub fn new(origin: OriginId) -> Self {
        Self {
            origin,
            max_retries: 3,
            drain_interval: Duration::from_secs(5),
            submit_timeout: Duration::from_secs(10),
            auto_resolve: true,
            analyzer: AnalyzerConfig::default(),
            backoff: RetryConfig::new(3),
            event_capacity: 256,
        }
    }
}

/// Result of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub synced: usize,
    pub failed: usize,
    pub conflicts: usize,
}

/// Outcome of processing a single dequeued item.
enum ItemOutcome {
    Confirmed,
    Conflicted,
    Retrying,
    Failed,
}

#[derive(Debug, Clone)]
struct StatusFlags {
    is_connected: bool,
    is_syncing: bool,
    last_sync_time: Option<chrono::DateTime<chrono::Utc>>,
    error: Option<String>,
}

/// Orchestrates the offline queue, the change feed, and conflict resolution.
///
/// Single logical owner of queue and status: external callers enqueue
/// intents and read broadcast status, nothing else. Constructed explicitly
/// and passed around; tests build isolated instances.
pub struct SyncCoordinator<R: RemoteStore + ?Sized> {
    remote: Arc<R>,
    queue: RwLock<OfflineQueue>,
    state: RwLock<SyncState>,
    conflicts: RwLock<Vec<SyncConflict>>,
    /// Inbound changes held back while their entity is conflicted.
    parked: RwLock<HashMap<(EntityKind, EntityId), Vec<RemoteChange>>>,
    flags: RwLock<StatusFlags>,
    events: EventBus,
    analyzer: ConflictAnalyzer,
    fetcher: RetryExecutor,
    force_tx: mpsc::Sender<()>,
    force_rx: Mutex<Option<mpsc::Receiver<()>>>,
    config: SyncConfig,
}

impl<R: RemoteStore + ?Sized> SyncCoordinator<R> {
    /// Create a coordinator journaling its queue under `queue_dir`.
    pub async fn new(
        remote: Arc<R>,
        queue_dir: impl AsRef<std::path::Path>,
        config: SyncConfig,
    ) -> Result<Self> {
        let queue =
            OfflineQueue::open(queue_dir, config.max_retries, config.backoff.clone()).await?;
        let (force_tx, force_rx) = mpsc::channel(16);

        Ok(Self {
            remote,
            queue: RwLock::new(queue),
            state: RwLock::new(SyncState::new()),
            conflicts: RwLock::new(Vec::new()),
            parked: RwLock::new(HashMap::new()),
            flags: RwLock::new(StatusFlags {
                is_connected: true,
                is_syncing: false,
                last_sync_time: None,
                error: None,
            }),
            events: EventBus::new(config.event_capacity),
            analyzer: ConflictAnalyzer::new(config.analyzer.clone()),
            fetcher: RetryExecutor::new(config.backoff.clone()),
            force_tx,
            force_rx: Mutex::new(Some(force_rx)),
            config,
        })
    }

    /// The event bus consumers subscribe to.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Subscribe to sync events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// This coordinator's origin id.
    pub fn origin(&self) -> &OriginId {
        &self.config.origin
    }

    /// Last server version observed for an entity (0 if never seen).
    pub async fn known_version(&self, kind: EntityKind, id: &EntityId) -> u64 {
        self.state
            .read()
            .await
            .get(kind, id)
            .map_or(0, |e| e.remote_version)
    }

    /// Current process-wide status snapshot.
    pub async fn status(&self) -> SyncStatus {
        let flags = self.flags.read().await.clone();
        SyncStatus {
            is_connected: flags.is_connected,
            is_syncing: flags.is_syncing,
            last_sync_time: flags.last_sync_time,
            pending_operations: self.queue.read().await.pending_count(),
            conflicts: self.conflicts.read().await.clone(),
            error: flags.error,
        }
    }

    /// Queue a locally-produced operation for delivery.
    pub async fn enqueue_local(&self, op: SyncOperation) -> Result<QueueItem> {
        debug!("Enqueue {:?} for {}/{}", op.op, op.kind, op.entity_id);
        let (kind, entity_id) = (op.kind, op.entity_id.clone());
        let item = self.queue.write().await.enqueue(op).await?;
        self.state.write().await.entry(kind, &entity_id).mark_queued();
        Ok(item)
    }

    /// Flush the queue now, bypassing the drain interval (but never the
    /// one-in-flight-per-entity rule) and the offline gate.
    pub async fn force_sync(&self) -> Result<DrainSummary> {
        self.drain(true).await
    }

    /// Explicit connectivity signal from the host.
    pub async fn set_connected(&self, connected: bool) {
        if connected {
            self.mark_online().await;
        } else {
            let mut flags = self.flags.write().await;
            if flags.is_connected {
                flags.is_connected = false;
                drop(flags);
                info!("Working offline; mutations will queue");
                self.events.emit(SyncEvent::Disconnected);
            }
        }
    }

    /// Clear the sticky terminal-error indicator.
    pub async fn dismiss_error(&self) {
        self.flags.write().await.error = None;
    }

    /// Reset a terminal failed queue item for another round of attempts.
    pub async fn retry_failed(&self, item_id: &str) -> Result<()> {
        self.queue.write().await.retry_failed(item_id).await?;
        self.dismiss_error().await;
        Ok(())
    }

    /// Terminal failed items, for inspection.
    pub async fn failed_operations(&self) -> Vec<QueueItem> {
        self.queue
            .read()
            .await
            .failed_items()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Fetch a whole collection from the remote store, with retries.
    pub async fn load_remote(&self, kind: EntityKind) -> Result<Vec<RemoteRecord>> {
        let remote = self.remote.clone();
        self.fetcher
            .execute(|| {
                let remote = remote.clone();
                async move { remote.list(kind).await }
            })
            .await
    }

    /// Drain the queue once. `force` bypasses the offline gate.
    pub async fn drain(&self, force: bool) -> Result<DrainSummary> {
        if !force && !self.flags.read().await.is_connected {
            debug!("Offline; skipping drain");
            return Ok(DrainSummary::default());
        }

        self.flags.write().await.is_syncing = true;
        self.events.emit(SyncEvent::SyncStarted);

        let mut summary = DrainSummary::default();
        loop {
            let item = self.queue.write().await.dequeue_next().await?;
            let Some(item) = item else { break };
            match self.process_item(item).await? {
                ItemOutcome::Confirmed => summary.synced += 1,
                ItemOutcome::Conflicted => summary.conflicts += 1,
                ItemOutcome::Retrying | ItemOutcome::Failed => summary.failed += 1,
            }
        }

        {
            let mut flags = self.flags.write().await;
            flags.is_syncing = false;
            flags.last_sync_time = Some(chrono::Utc::now());
        }
        self.events.emit(SyncEvent::SyncCompleted {
            synced: summary.synced,
            failed: summary.failed,
            conflicts: summary.conflicts,
        });
        debug!(
            "Drain complete: {} synced, {} failed, {} conflicts",
            summary.synced, summary.failed, summary.conflicts
        );
        Ok(summary)
    }

    /// Apply one change-feed entry.
    ///
    /// Our own echoed writes are ignored. Changes for a conflicted entity
    /// are parked until the conflict resolves. A change colliding with
    /// queued local work becomes a conflict; otherwise it applies directly.
    pub async fn handle_remote_change(&self, change: RemoteChange) -> Result<()> {
        if change.origin == self.config.origin {
            trace!("Ignoring echo of our own write for {}/{}", change.kind, change.id);
            return Ok(());
        }

        if self.state.read().await.is_conflicted(change.kind, &change.id) {
            debug!(
                "Parking remote change for conflicted {}/{}",
                change.kind, change.id
            );
            self.parked
                .write()
                .await
                .entry((change.kind, change.id.clone()))
                .or_default()
                .push(change);
            return Ok(());
        }

        if self.queue.read().await.has_in_flight(change.kind, &change.id) {
            // The in-flight submission will observe this write as a version
            // mismatch and raise the conflict itself.
            debug!(
                "Submission in flight for {}/{}; leaving remote change to its outcome",
                change.kind, change.id
            );
            return Ok(());
        }

        let local_items = self
            .queue
            .write()
            .await
            .take_entity(change.kind, &change.id)
            .await?;

        match local_items.into_iter().last() {
            None => self.apply_remote(change).await,
            Some(item) => {
                // Concurrent edit: queued local work vs. this remote change.
                self.raise_conflict(item.operation, change.record).await?;
                Ok(())
            }
        }
    }

    /// Resolve a surfaced conflict.
    ///
    /// `local` re-enqueues the local operation rebased onto the server's
    /// version; `remote` discards the local operation and applies the server
    /// value; `merge` applies `merged_data` locally and re-enqueues it.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        resolution: Resolution,
        merged_data: Option<FieldMap>,
    ) -> Result<()> {
        let conflict = {
            let mut conflicts = self.conflicts.write().await;
            let pos = conflicts
                .iter()
                .position(|c| c.id == conflict_id)
                .ok_or_else(|| Error::NotFound(format!("Conflict not found: {}", conflict_id)))?;
            conflicts.remove(pos)
        };
        let (kind, entity_id) = conflict.key();
        info!(
            "Resolving conflict {} for {}/{} as {:?}",
            conflict_id, kind, entity_id, resolution
        );

        match resolution {
            Resolution::Local => {
                let mut op = conflict.local.clone();
                if conflict.remote.is_delete() {
                    // Row vanished remotely; recreate it with the local data.
                    op.op = OperationType::Create;
                    op.version = 0;
                } else {
                    if op.op == OperationType::Create {
                        op.op = OperationType::Update;
                    }
                    op.version = conflict.remote.version;
                }
                self.queue.write().await.enqueue(op).await?;
                self.state.write().await.entry(kind, &entity_id).mark_queued();
            }
            Resolution::Remote => {
                if conflict.remote.is_delete() {
                    self.state.write().await.remove(kind, &entity_id);
                    self.events.emit(SyncEvent::RemoteApplied {
                        kind,
                        entity_id: entity_id.clone(),
                        change: AppliedChange::Delete,
                        data: None,
                    });
                } else {
                    self.state
                        .write()
                        .await
                        .entry(kind, &entity_id)
                        .mark_confirmed(conflict.remote.version);
                    self.events.emit(SyncEvent::RemoteApplied {
                        kind,
                        entity_id: entity_id.clone(),
                        change: AppliedChange::Update,
                        data: Some(conflict.remote.data.clone()),
                    });
                }
            }
            Resolution::Merge => {
                let merged = merged_data
                    .or_else(|| conflict.analysis.merged_data.clone())
                    .ok_or_else(|| {
                        Error::InvalidInput("Merge resolution requires merged data".to_string())
                    })?;
                let monetary = monetary_fields(kind);
                if conflict
                    .analysis
                    .conflicting_fields
                    .iter()
                    .any(|f| monetary.contains(&f.as_str()))
                {
                    // Put it back; the caller must pick a side instead.
                    self.conflicts.write().await.push(conflict);
                    return Err(Error::InvalidInput(
                        "Merge is not allowed on monetary field conflicts".to_string(),
                    ));
                }
                self.events.emit(SyncEvent::RemoteApplied {
                    kind,
                    entity_id: entity_id.clone(),
                    change: AppliedChange::Merge,
                    data: Some(merged.clone()),
                });
                let op = SyncOperation::new(
                    OperationType::Update,
                    kind,
                    entity_id.clone(),
                    merged,
                    self.config.origin.clone(),
                    conflict.remote.version,
                );
                self.queue.write().await.enqueue(op).await?;
                self.state.write().await.entry(kind, &entity_id).mark_queued();
            }
        }

        self.events.emit(SyncEvent::ConflictResolved {
            conflict_id: conflict.id,
            kind,
            entity_id: entity_id.clone(),
            resolution,
        });

        // Replay inbound changes parked behind this conflict, in arrival order.
        let parked = self
            .parked
            .write()
            .await
            .remove(&(kind, entity_id))
            .unwrap_or_default();
        for change in parked {
            self.handle_remote_change(change).await?;
        }
        Ok(())
    }

    /// Run the coordinator loop until `shutdown` fires.
    ///
    /// Drains on an interval, drains immediately on force/reconnect
    /// requests, and applies change-feed entries as they arrive. Spawn this
    /// in a tokio task.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut force_rx = self
            .force_rx
            .lock()
            .await
            .take()
            .expect("run can only be called once");

        let (inbound_tx, mut inbound_rx) = mpsc::channel::<RemoteChange>(256);
        for kind in EntityKind::ALL {
            let mut feed = self.remote.subscribe(kind);
            let tx = inbound_tx.clone();
            tokio::spawn(async move {
                loop {
                    match feed.recv().await {
                        Ok(change) => {
                            if tx.send(change).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Change feed for {} lagged by {}", kind, n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        }
        drop(inbound_tx);

        let mut tick = tokio::time::interval(self.config.drain_interval);
        info!("Sync coordinator started");

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.drain(false).await {
                        error!("Drain failed: {}", e);
                    }
                }
                Some(_) = force_rx.recv() => {
                    if let Err(e) = self.drain(true).await {
                        error!("Forced drain failed: {}", e);
                    }
                }
                inbound = inbound_rx.recv() => {
                    match inbound {
                        Some(change) => {
                            if let Err(e) = self.handle_remote_change(change).await {
                                error!("Failed to apply remote change: {}", e);
                            }
                        }
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    info!("Sync coordinator shutting down");
                    break;
                }
            }
        }
    }

    /// Submit one dequeued item to the remote store.
    async fn process_item(&self, item: QueueItem) -> Result<ItemOutcome> {
        let op = item.operation.clone();
        self.state
            .write()
            .await
            .entry(op.kind, &op.entity_id)
            .mark_sending();

        let submit = async {
            if op.is_delete() {
                self.remote.delete(&op).await
            } else {
                self.remote.upsert(&op).await
            }
        };
        let result = match timeout(self.config.submit_timeout, submit).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "Submission of {} timed out",
                op.id
            ))),
        };

        match result {
            Ok(UpsertOutcome::Applied(record)) => {
                self.queue.write().await.mark_succeeded(&item.id).await?;
                let mut state = self.state.write().await;
                if op.is_delete() {
                    state.remove(op.kind, &op.entity_id);
                } else {
                    state
                        .entry(op.kind, &op.entity_id)
                        .mark_confirmed(record.version);
                }
                drop(state);
                self.mark_online().await;
                Ok(ItemOutcome::Confirmed)
            }
            Ok(UpsertOutcome::VersionMismatch { current }) => {
                // The operation leaves the queue either way; on conflict it
                // lives inside the SyncConflict until resolved.
                self.queue.write().await.mark_succeeded(&item.id).await?;
                self.mark_online().await;
                self.raise_conflict(op, current).await
            }
            Err(err) if err.is_transient() => {
                self.mark_offline(&err).await;
                let outcome = self
                    .queue
                    .write()
                    .await
                    .mark_failed(&item.id, &err.to_string())
                    .await?;
                match outcome {
                    FailureOutcome::WillRetry { delay } => {
                        debug!(
                            "Transient failure for {}/{}; retrying in {:?}",
                            op.kind, op.entity_id, delay
                        );
                        self.state
                            .write()
                            .await
                            .entry(op.kind, &op.entity_id)
                            .mark_failed(err.to_string(), true);
                        Ok(ItemOutcome::Retrying)
                    }
                    FailureOutcome::Exhausted => {
                        self.report_terminal_failure(op, err.to_string()).await;
                        Ok(ItemOutcome::Failed)
                    }
                }
            }
            Err(err) => {
                // Validation/server rejection: terminal immediately.
                self.queue
                    .write()
                    .await
                    .mark_rejected(&item.id, &err.to_string())
                    .await?;
                self.report_terminal_failure(op, err.to_string()).await;
                Ok(ItemOutcome::Failed)
            }
        }
    }

    /// Build a conflict from a divergent local operation + remote state, then
    /// auto-apply a safe merge or surface it for manual resolution.
    async fn raise_conflict(
        &self,
        local_op: SyncOperation,
        current: Option<RemoteRecord>,
    ) -> Result<ItemOutcome> {
        if local_op.is_delete() && current.is_none() {
            // Both sides wanted the row gone.
            self.state
                .write()
                .await
                .remove(local_op.kind, &local_op.entity_id);
            return Ok(ItemOutcome::Confirmed);
        }

        let (remote_op, remote_version) = match current {
            Some(r) => {
                let version = r.version;
                (
                    SyncOperation::remote(
                        OperationType::Update,
                        r.kind,
                        r.id,
                        r.data,
                        r.updated_at,
                        r.origin,
                        r.version,
                    ),
                    version,
                )
            }
            None => (
                SyncOperation::remote(
                    OperationType::Delete,
                    local_op.kind,
                    local_op.entity_id.clone(),
                    FieldMap::new(),
                    chrono::Utc::now(),
                    OriginId::new("remote")?,
                    0,
                ),
                0,
            ),
        };

        let analysis = self.analyzer.analyze(
            local_op.kind,
            &local_op.data,
            &remote_op.data,
            local_op.timestamp,
            remote_op.timestamp,
        );
        let conflict = SyncConflict::new(local_op, remote_op, analysis);
        let (kind, entity_id) = conflict.key();

        // Deletes have no field-level merge; they always go to the user.
        let auto = self.config.auto_resolve
            && conflict.analysis.can_auto_resolve
            && conflict.analysis.suggested == SuggestedResolution::Merge
            && !conflict.local.is_delete()
            && !conflict.remote.is_delete();

        if auto {
            let merged = conflict.analysis.merged_data.clone().ok_or_else(|| {
                Error::Conflict("Merge suggested without merged data".to_string())
            })?;
            info!(
                "Auto-resolving conflict for {}/{} (confidence {})",
                kind, entity_id, conflict.analysis.confidence
            );
            self.events.emit(SyncEvent::RemoteApplied {
                kind,
                entity_id: entity_id.clone(),
                change: AppliedChange::Merge,
                data: Some(merged.clone()),
            });
            let op = SyncOperation::new(
                OperationType::Update,
                kind,
                entity_id.clone(),
                merged,
                self.config.origin.clone(),
                remote_version,
            );
            self.queue.write().await.enqueue(op).await?;
            self.state.write().await.entry(kind, &entity_id).mark_queued();
            self.events.emit(SyncEvent::ConflictAutoResolved {
                conflict_id: conflict.id,
                kind,
                entity_id,
                resolution: Resolution::Merge,
            });
        } else {
            warn!(
                "Conflict detected for {}/{} (severity {:?}); holding for resolution",
                kind, entity_id, conflict.analysis.severity
            );
            self.state.write().await.entry(kind, &entity_id).mark_conflicted();
            self.conflicts.write().await.push(conflict.clone());
            self.events.emit(SyncEvent::ConflictDetected { conflict });
        }
        Ok(ItemOutcome::Conflicted)
    }

    /// Apply a remote change that collides with nothing local.
    async fn apply_remote(&self, change: RemoteChange) -> Result<()> {
        let applied = match change.op {
            OperationType::Create => AppliedChange::Create,
            OperationType::Update => AppliedChange::Update,
            OperationType::Delete => AppliedChange::Delete,
        };
        {
            let mut state = self.state.write().await;
            match &change.record {
                Some(r) => {
                    state.entry(change.kind, &change.id).observe_remote(r.version);
                }
                None => {
                    state.remove(change.kind, &change.id);
                }
            }
        }
        debug!("Applying remote {:?} for {}/{}", change.op, change.kind, change.id);
        self.events.emit(SyncEvent::RemoteApplied {
            kind: change.kind,
            entity_id: change.id,
            change: applied,
            data: change.record.map(|r| r.data),
        });
        Ok(())
    }

    async fn report_terminal_failure(&self, op: SyncOperation, error: String) {
        error!(
            "Operation {:?} for {}/{} failed terminally: {}",
            op.op, op.kind, op.entity_id, error
        );
        self.state
            .write()
            .await
            .entry(op.kind, &op.entity_id)
            .mark_failed(error.clone(), false);
        self.flags.write().await.error = Some(error.clone());
        self.events.emit(SyncEvent::SyncFailed {
            operation: op,
            error,
        });
    }

    async fn mark_online(&self) {
        let mut flags = self.flags.write().await;
        if !flags.is_connected {
            flags.is_connected = true;
            drop(flags);
            info!("Connectivity restored");
            self.events.emit(SyncEvent::Connected);
            // Nudge the run loop into an immediate drain.
            let _ = self.force_tx.try_send(());
        }
    }

    async fn mark_offline(&self, err: &Error) {
        let mut flags = self.flags.write().await;
        if flags.is_connected {
            flags.is_connected = false;
            drop(flags);
            warn!("Connectivity lost: {}", err);
            self.events.emit(SyncEvent::Disconnected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ledgerline_store::MemoryStore;
    use serde_json::json;
    use tempfile::TempDir;

    fn eid(s: &str) -> EntityId {
        EntityId::new(s).unwrap()
    }

    fn fields(pairs: &[(&str, serde_json::Value)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn config() -> SyncConfig {
        let mut cfg = SyncConfig::new(OriginId::new("device-a").unwrap());
        cfg.backoff = RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false);
        cfg
    }

    fn local_op(
        op: OperationType,
        id: &str,
        version: u64,
        pairs: &[(&str, serde_json::Value)],
    ) -> SyncOperation {
        SyncOperation::new(
            op,
            EntityKind::Transaction,
            eid(id),
            fields(pairs),
            OriginId::new("device-a").unwrap(),
            version,
        )
    }

    /// Write a row from another device, returning its current state.
    async fn seed(
        store: &MemoryStore,
        id: &str,
        version: u64,
        pairs: &[(&str, serde_json::Value)],
    ) -> RemoteRecord {
        let op_type = if version == 0 {
            OperationType::Create
        } else {
            OperationType::Update
        };
        let op = SyncOperation::new(
            op_type,
            EntityKind::Transaction,
            eid(id),
            fields(pairs),
            OriginId::new("device-b").unwrap(),
            version,
        );
        match store.upsert(&op).await.unwrap() {
            UpsertOutcome::Applied(record) => record,
            other => panic!("seed write should apply, got {:?}", other),
        }
    }

    fn change_from(record: &RemoteRecord, op: OperationType) -> RemoteChange {
        RemoteChange {
            kind: record.kind,
            id: record.id.clone(),
            op,
            record: Some(record.clone()),
            origin: record.origin.clone(),
            at: record.updated_at,
        }
    }

    async fn coordinator(
        store: &Arc<MemoryStore>,
        dir: &TempDir,
        cfg: SyncConfig,
    ) -> SyncCoordinator<MemoryStore> {
        SyncCoordinator::new(store.clone(), dir.path(), cfg)
            .await
            .unwrap()
    }

    fn event_names(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        names
    }

    #[tokio::test]
    async fn test_enqueue_then_drain_delivers() {
        let store = Arc::new(MemoryStore::new());
        let dir = TempDir::new().unwrap();
        let coord = coordinator(&store, &dir, config()).await;

        coord
            .enqueue_local(local_op(
                OperationType::Create,
                "t1",
                0,
                &[("amount", json!(50))],
            ))
            .await
            .unwrap();
        let summary = coord.force_sync().await.unwrap();

        assert_eq!(summary.synced, 1);
        assert_eq!(store.version_of(EntityKind::Transaction, &eid("t1")), Some(1));
        assert_eq!(coord.known_version(EntityKind::Transaction, &eid("t1")).await, 1);
        assert_eq!(coord.status().await.pending_operations, 0);
    }

    #[tokio::test]
    async fn test_offline_buffers_then_drains_on_reconnect() {
        let store = Arc::new(MemoryStore::new());
        let dir = TempDir::new().unwrap();
        let coord = coordinator(&store, &dir, config()).await;

        coord.set_connected(false).await;
        for id in ["t1", "t2", "t3"] {
            coord
                .enqueue_local(local_op(OperationType::Create, id, 0, &[("amount", json!(1))]))
                .await
                .unwrap();
        }

        // The periodic drain is gated while offline.
        let summary = coord.drain(false).await.unwrap();
        assert_eq!(summary, DrainSummary::default());
        assert_eq!(coord.status().await.pending_operations, 3);
        assert_eq!(store.version_of(EntityKind::Transaction, &eid("t1")), None);

        coord.set_connected(true).await;
        let summary = coord.force_sync().await.unwrap();
        assert_eq!(summary.synced, 3);
        for id in ["t1", "t2", "t3"] {
            assert_eq!(store.version_of(EntityKind::Transaction, &eid(id)), Some(1));
        }
    }

    #[tokio::test]
    async fn test_stale_monetary_write_surfaces_conflict() {
        let store = Arc::new(MemoryStore::new());
        let dir = TempDir::new().unwrap();
        let coord = coordinator(&store, &dir, config()).await;
        let mut rx = coord.subscribe();

        seed(&store, "t1", 0, &[("amount", json!(80))]).await;
        coord
            .enqueue_local(local_op(
                OperationType::Update,
                "t1",
                0,
                &[("amount", json!(100))],
            ))
            .await
            .unwrap();
        let summary = coord.force_sync().await.unwrap();

        assert_eq!(summary.conflicts, 1);
        let status = coord.status().await;
        assert_eq!(status.conflicts.len(), 1);
        assert!(!status.conflicts[0].analysis.can_auto_resolve);
        // Pulled out of the queue; it lives in the conflict now.
        assert_eq!(status.pending_operations, 0);
        assert!(event_names(&mut rx).contains(&"conflict-detected"));
        // Server value untouched until a resolution is applied.
        let row = store
            .fetch(EntityKind::Transaction, &eid("t1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.data["amount"], json!(80));
    }

    #[tokio::test]
    async fn test_non_monetary_conflict_auto_merges() {
        let store = Arc::new(MemoryStore::new());
        let dir = TempDir::new().unwrap();
        let coord = coordinator(&store, &dir, config()).await;
        let mut rx = coord.subscribe();

        seed(&store, "t1", 0, &[("notes", json!("food")), ("amount", json!(50))]).await;
        let mut op = local_op(OperationType::Update, "t1", 0, &[
            ("notes", json!("groceries")),
            ("amount", json!(50)),
        ]);
        // Clearly the later edit.
        op.timestamp = Utc::now() + chrono::Duration::seconds(60);
        coord.enqueue_local(op).await.unwrap();

        let summary = coord.force_sync().await.unwrap();

        // One conflict auto-merged, then the merged update delivered.
        assert_eq!(summary.conflicts, 1);
        assert_eq!(summary.synced, 1);
        assert!(coord.status().await.conflicts.is_empty());
        let names = event_names(&mut rx);
        assert!(names.contains(&"remote-merge"));
        assert!(names.contains(&"conflict-auto-resolved"));

        let row = store
            .fetch(EntityKind::Transaction, &eid("t1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.data["notes"], json!("groceries"));
        assert_eq!(row.data["amount"], json!(50));
        assert_eq!(row.version, 2);
    }

    #[tokio::test]
    async fn test_auto_resolve_disabled_surfaces_mergeable_conflict() {
        let store = Arc::new(MemoryStore::new());
        let dir = TempDir::new().unwrap();
        let mut cfg = config();
        cfg.auto_resolve = false;
        let coord = coordinator(&store, &dir, cfg).await;

        seed(&store, "t1", 0, &[("notes", json!("food"))]).await;
        coord
            .enqueue_local(local_op(
                OperationType::Update,
                "t1",
                0,
                &[("notes", json!("groceries"))],
            ))
            .await
            .unwrap();
        coord.force_sync().await.unwrap();

        let status = coord.status().await;
        assert_eq!(status.conflicts.len(), 1);
        assert!(status.conflicts[0].analysis.can_auto_resolve);
    }

    #[tokio::test]
    async fn test_resolve_remote_discards_local_operation() {
        let store = Arc::new(MemoryStore::new());
        let dir = TempDir::new().unwrap();
        let coord = coordinator(&store, &dir, config()).await;

        seed(&store, "t1", 0, &[("amount", json!(80))]).await;
        coord
            .enqueue_local(local_op(
                OperationType::Update,
                "t1",
                0,
                &[("amount", json!(100))],
            ))
            .await
            .unwrap();
        coord.force_sync().await.unwrap();
        let conflict_id = coord.status().await.conflicts[0].id.clone();

        let mut rx = coord.subscribe();
        coord
            .resolve_conflict(&conflict_id, Resolution::Remote, None)
            .await
            .unwrap();

        assert!(coord.status().await.conflicts.is_empty());
        assert_eq!(coord.status().await.pending_operations, 0);
        assert_eq!(coord.known_version(EntityKind::Transaction, &eid("t1")).await, 1);
        let names = event_names(&mut rx);
        assert!(names.contains(&"remote-update"));
        assert!(names.contains(&"conflict-resolved"));
    }

    #[tokio::test]
    async fn test_resolve_local_overwrites_server() {
        let store = Arc::new(MemoryStore::new());
        let dir = TempDir::new().unwrap();
        let coord = coordinator(&store, &dir, config()).await;

        seed(&store, "t1", 0, &[("amount", json!(80))]).await;
        coord
            .enqueue_local(local_op(
                OperationType::Update,
                "t1",
                0,
                &[("amount", json!(100))],
            ))
            .await
            .unwrap();
        coord.force_sync().await.unwrap();
        let conflict_id = coord.status().await.conflicts[0].id.clone();

        coord
            .resolve_conflict(&conflict_id, Resolution::Local, None)
            .await
            .unwrap();
        let summary = coord.force_sync().await.unwrap();

        // Rebased onto the server's version and accepted; nothing lost.
        assert_eq!(summary.synced, 1);
        let row = store
            .fetch(EntityKind::Transaction, &eid("t1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.data["amount"], json!(100));
        assert_eq!(row.version, 2);
    }

    #[tokio::test]
    async fn test_merge_resolution_rejected_on_monetary_conflict() {
        let store = Arc::new(MemoryStore::new());
        let dir = TempDir::new().unwrap();
        let coord = coordinator(&store, &dir, config()).await;

        seed(&store, "t1", 0, &[("amount", json!(80))]).await;
        coord
            .enqueue_local(local_op(
                OperationType::Update,
                "t1",
                0,
                &[("amount", json!(100))],
            ))
            .await
            .unwrap();
        coord.force_sync().await.unwrap();
        let conflict_id = coord.status().await.conflicts[0].id.clone();

        let err = coord
            .resolve_conflict(
                &conflict_id,
                Resolution::Merge,
                Some(fields(&[("amount", json!(90))])),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        // Still unresolved.
        assert_eq!(coord.status().await.conflicts.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_reports_failure_once() {
        let store = Arc::new(MemoryStore::new());
        let dir = TempDir::new().unwrap();
        let mut cfg = config();
        cfg.max_retries = 0;
        let coord = coordinator(&store, &dir, cfg).await;
        let mut rx = coord.subscribe();

        store.fail_next(1);
        coord
            .enqueue_local(local_op(OperationType::Create, "t1", 0, &[]))
            .await
            .unwrap();
        let summary = coord.force_sync().await.unwrap();

        assert_eq!(summary.failed, 1);
        let names = event_names(&mut rx);
        assert_eq!(names.iter().filter(|n| **n == "sync-failed").count(), 1);
        assert!(names.contains(&"disconnected"));
        // Retained and queryable, not silently dropped.
        let failed = coord.failed_operations().await;
        assert_eq!(failed.len(), 1);
        assert!(coord.status().await.error.is_some());

        // Manual retry delivers it and clears the sticky error.
        coord.retry_failed(&failed[0].id).await.unwrap();
        let summary = coord.force_sync().await.unwrap();
        assert_eq!(summary.synced, 1);
        assert!(coord.status().await.error.is_none());
    }

    #[tokio::test]
    async fn test_transient_failure_backs_off_then_succeeds() {
        let store = Arc::new(MemoryStore::new());
        let dir = TempDir::new().unwrap();
        let coord = coordinator(&store, &dir, config()).await;
        let mut rx = coord.subscribe();

        store.fail_next(1);
        coord
            .enqueue_local(local_op(OperationType::Create, "t1", 0, &[]))
            .await
            .unwrap();

        let summary = coord.force_sync().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(store.version_of(EntityKind::Transaction, &eid("t1")), None);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let summary = coord.force_sync().await.unwrap();
        assert_eq!(summary.synced, 1);
        assert!(!event_names(&mut rx).contains(&"sync-failed"));
    }

    #[tokio::test]
    async fn test_remote_change_applies_when_nothing_queued() {
        let store = Arc::new(MemoryStore::new());
        let dir = TempDir::new().unwrap();
        let coord = coordinator(&store, &dir, config()).await;
        let mut rx = coord.subscribe();

        let record = seed(&store, "t1", 0, &[("amount", json!(50))]).await;
        coord
            .handle_remote_change(change_from(&record, OperationType::Create))
            .await
            .unwrap();

        assert_eq!(coord.known_version(EntityKind::Transaction, &eid("t1")).await, 1);
        assert!(coord.status().await.conflicts.is_empty());
        assert!(event_names(&mut rx).contains(&"remote-create"));
    }

    #[tokio::test]
    async fn test_own_echo_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        let dir = TempDir::new().unwrap();
        let coord = coordinator(&store, &dir, config()).await;
        let mut rx = coord.subscribe();

        let mut record = seed(&store, "t1", 0, &[("amount", json!(50))]).await;
        record.origin = OriginId::new("device-a").unwrap();
        let mut change = change_from(&record, OperationType::Update);
        change.origin = OriginId::new("device-a").unwrap();

        coord.handle_remote_change(change).await.unwrap();

        assert_eq!(coord.known_version(EntityKind::Transaction, &eid("t1")).await, 0);
        assert!(event_names(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_double_remote_update_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let dir = TempDir::new().unwrap();
        let coord = coordinator(&store, &dir, config()).await;

        let record = seed(&store, "t1", 0, &[("amount", json!(50))]).await;
        let change = change_from(&record, OperationType::Update);
        coord.handle_remote_change(change.clone()).await.unwrap();
        coord.handle_remote_change(change).await.unwrap();

        assert_eq!(coord.known_version(EntityKind::Transaction, &eid("t1")).await, 1);
        assert!(coord.status().await.conflicts.is_empty());
    }

    #[tokio::test]
    async fn test_remote_change_folds_queued_local_work_into_conflict() {
        let store = Arc::new(MemoryStore::new());
        let dir = TempDir::new().unwrap();
        let coord = coordinator(&store, &dir, config()).await;

        coord
            .enqueue_local(local_op(
                OperationType::Update,
                "t1",
                1,
                &[("amount", json!(100))],
            ))
            .await
            .unwrap();
        let record = seed(&store, "t1", 0, &[("amount", json!(80))]).await;
        coord
            .handle_remote_change(change_from(&record, OperationType::Update))
            .await
            .unwrap();

        let status = coord.status().await;
        assert_eq!(status.conflicts.len(), 1);
        assert_eq!(status.pending_operations, 0);
    }

    #[tokio::test]
    async fn test_inbound_change_defers_to_in_flight_submission() {
        let store = Arc::new(MemoryStore::new());
        let dir = TempDir::new().unwrap();
        let coord = Arc::new(coordinator(&store, &dir, config()).await);

        coord
            .enqueue_local(local_op(
                OperationType::Create,
                "t1",
                0,
                &[("amount", json!(50))],
            ))
            .await
            .unwrap();

        // Hold the submission in flight while a change arrives for the
        // same entity.
        store.set_latency(Duration::from_millis(100));
        let drain = tokio::spawn({
            let coord = coord.clone();
            async move { coord.force_sync().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let change = RemoteChange {
            kind: EntityKind::Transaction,
            id: eid("t1"),
            op: OperationType::Update,
            record: Some(RemoteRecord {
                kind: EntityKind::Transaction,
                id: eid("t1"),
                data: fields(&[("amount", json!(80))]),
                version: 1,
                updated_at: Utc::now(),
                origin: OriginId::new("device-b").unwrap(),
            }),
            origin: OriginId::new("device-b").unwrap(),
            at: Utc::now(),
        };
        coord.handle_remote_change(change).await.unwrap();

        // The in-flight item was not stolen; the drain settles it normally.
        let summary = drain.await.unwrap().unwrap();
        assert_eq!(summary.synced, 1);
        assert_eq!(coord.status().await.pending_operations, 0);
    }

    #[tokio::test]
    async fn test_parked_changes_replay_after_resolution() {
        let store = Arc::new(MemoryStore::new());
        let dir = TempDir::new().unwrap();
        let coord = coordinator(&store, &dir, config()).await;

        coord
            .enqueue_local(local_op(
                OperationType::Update,
                "t1",
                1,
                &[("amount", json!(100))],
            ))
            .await
            .unwrap();
        let record = seed(&store, "t1", 0, &[("amount", json!(80))]).await;
        coord
            .handle_remote_change(change_from(&record, OperationType::Update))
            .await
            .unwrap();
        assert_eq!(coord.status().await.conflicts.len(), 1);

        // A further remote edit arrives while the conflict is open: parked.
        let later = seed(&store, "t1", 1, &[("amount", json!(85))]).await;
        let mut rx = coord.subscribe();
        coord
            .handle_remote_change(change_from(&later, OperationType::Update))
            .await
            .unwrap();
        assert!(event_names(&mut rx).is_empty());

        let conflict_id = coord.status().await.conflicts[0].id.clone();
        coord
            .resolve_conflict(&conflict_id, Resolution::Remote, None)
            .await
            .unwrap();

        // Parked change replayed after resolution.
        assert_eq!(coord.known_version(EntityKind::Transaction, &eid("t1")).await, 2);
        let names = event_names(&mut rx);
        let resolved = names.iter().position(|n| *n == "conflict-resolved").unwrap();
        let replayed = names.iter().rposition(|n| *n == "remote-update").unwrap();
        assert!(replayed > resolved);
    }

    #[tokio::test]
    async fn test_delete_of_already_deleted_row_confirms() {
        let store = Arc::new(MemoryStore::new());
        let dir = TempDir::new().unwrap();
        let coord = coordinator(&store, &dir, config()).await;

        coord
            .enqueue_local(local_op(OperationType::Delete, "ghost", 0, &[]))
            .await
            .unwrap();
        let summary = coord.force_sync().await.unwrap();

        assert_eq!(summary.synced, 1);
        assert!(coord.status().await.conflicts.is_empty());
    }

    #[tokio::test]
    async fn test_run_loop_applies_feed_changes() {
        let store = Arc::new(MemoryStore::new());
        let dir = TempDir::new().unwrap();
        let mut cfg = config();
        cfg.drain_interval = Duration::from_secs(60);
        let coord = Arc::new(coordinator(&store, &dir, cfg).await);
        let mut rx = coord.subscribe();

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(coord.clone().run(shutdown_rx));
        // Let the feed forwarders subscribe before writing.
        tokio::time::sleep(Duration::from_millis(20)).await;

        seed(&store, "t1", 0, &[("amount", json!(50))]).await;

        let event = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = rx.recv().await.unwrap();
                if event.name() == "remote-create" {
                    break event;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(event.name(), "remote-create");
        assert_eq!(coord.known_version(EntityKind::Transaction, &eid("t1")).await, 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
