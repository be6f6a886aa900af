//! Durable snapshots of the last-known local collection state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use ledgerline_common::{EntityId, Error, Result};
use ledgerline_model::{EntityKind, FieldMap};

/// JSON-file-per-collection snapshot store.
///
/// The adapter writes the in-memory collections through here after applying
/// inbound changes, so a restart resumes from the last observed state rather
/// than an empty one.
pub struct SnapshotStore {
    base_dir: PathBuf,
}

impl SnapshotStore {
    /// Create a snapshot store rooted at `base_dir`.
    pub async fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().join("snapshots");
        fs::create_dir_all(&base_dir).await.map_err(Error::Io)?;
        Ok(Self { base_dir })
    }

    fn path_for(&self, kind: EntityKind) -> PathBuf {
        self.base_dir.join(format!("{}.json", kind.as_str()))
    }

    /// Persist one collection.
    pub async fn save(
        &self,
        kind: EntityKind,
        collection: &HashMap<EntityId, FieldMap>,
    ) -> Result<()> {
        let json = serde_json::to_string_pretty(collection)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        fs::write(self.path_for(kind), json)
            .await
            .map_err(Error::Io)?;
        debug!("Snapshot saved: {} ({} rows)", kind, collection.len());
        Ok(())
    }

    /// Load one collection; empty when no snapshot exists yet.
    pub async fn load(&self, kind: EntityKind) -> Result<HashMap<EntityId, FieldMap>> {
        let path = self.path_for(kind);
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let content = fs::read_to_string(&path).await.map_err(Error::Io)?;
        serde_json::from_str(&content).map_err(|e| Error::Serialization(e.to_string()))
    }
}
