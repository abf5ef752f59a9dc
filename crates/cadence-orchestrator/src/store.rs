use crate::backlog::Backlog;
use crate::escalation::EscalationManager;
use crate::registry::AgentRecord;
use crate::task_queue::TaskQueue;
use async_trait::async_trait;
use cadence_core::{CadenceError, CadenceResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// Everything the loop needs to resume after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub backlog: Backlog,
    pub queue: TaskQueue,
    #[serde(default)]
    pub agents: Vec<AgentRecord>,
    #[serde(default)]
    pub escalations: EscalationManager,
    pub saved_at: DateTime<Utc>,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// The last saved snapshot, or `None` on a fresh start.
    async fn load(&self) -> CadenceResult<Option<Snapshot>>;
    async fn save(&self, snapshot: &Snapshot) -> CadenceResult<()>;
}

/// Single-file JSON store under the data directory.
pub struct JsonStateStore {
    path: PathBuf,
}

impl JsonStateStore {
    pub const FILE_NAME: &'static str = "state.json";

    pub async fn new(dir: impl AsRef<Path>) -> CadenceResult<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        Ok(Self {
            path: dir.join(Self::FILE_NAME),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn load(&self) -> CadenceResult<Option<Snapshot>> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CadenceError::StateCorrupted(format!(
                    "cannot read '{}': {e}",
                    self.path.display()
                )))
            }
        };
        let snapshot: Snapshot = serde_json::from_str(&data).map_err(|e| {
            CadenceError::StateCorrupted(format!("cannot parse '{}': {e}", self.path.display()))
        })?;
        debug!(path = %self.path.display(), saved_at = %snapshot.saved_at, "State loaded");
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &Snapshot) -> CadenceResult<()> {
        let json = serde_json::to_string_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// In-memory store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStateStore {
    snapshot: Mutex<Option<Snapshot>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> CadenceResult<Option<Snapshot>> {
        Ok(self.snapshot.lock().await.clone())
    }

    async fn save(&self, snapshot: &Snapshot) -> CadenceResult<()> {
        *self.snapshot.lock().await = Some(snapshot.clone());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{Priority, Story};

    fn snapshot() -> Snapshot {
        let story = Story::new("S-1", "Title")
            .with_priority(Priority::P0)
            .with_size(3)
            .with_criteria(["a", "b", "c"]);
        let queue = TaskQueue::construct([&story]).unwrap();
        Snapshot {
            backlog: Backlog::new(vec![story]),
            queue,
            agents: vec![],
            escalations: EscalationManager::new(),
            saved_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_json_store_fresh_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStateStore::new(dir.path()).await.unwrap();
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_json_store_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStateStore::new(dir.path().join("data")).await.unwrap();
        store.save(&snapshot()).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.queue.total_count(), 4);
        assert_eq!(loaded.backlog.count(crate::types::StoryStatus::Backlog), 1);
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_json_store_corrupt_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStateStore::new(dir.path()).await.unwrap();
        tokio::fs::write(store.path(), "{ not json").await.unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, CadenceError::StateCorrupted(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStateStore::new();
        assert!(store.load().await.unwrap().is_none());
        store.save(&snapshot()).await.unwrap();
        assert!(store.load().await.unwrap().is_some());
    }
}
