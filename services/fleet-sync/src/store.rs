//! Durable storage for queued actions
//!
//! One record per action, keyed by its id. The queue serializes every write,
//! so stores do not need their own cross-record locking.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::queue::QueuedAction;

/// Persistence backend for the action queue
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait ActionStore: Send + Sync {
    /// Load every persisted record, in no particular order
    async fn load_all(&self) -> Result<Vec<QueuedAction>>;

    /// Insert or overwrite one record. Must be durable on return.
    async fn put(&self, action: &QueuedAction) -> Result<()>;

    /// Delete one record; missing records are not an error
    async fn remove(&self, id: Uuid) -> Result<()>;
}

/// Directory of `<uuid>.json` files
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Open (and create if needed) a store directory
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        debug!("Action store at {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

#[async_trait]
impl ActionStore for JsonFileStore {
    async fn load_all(&self) -> Result<Vec<QueuedAction>> {
        let mut actions = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) => {
                    warn!(
                        "Skipping unreadable action record {}: {}",
                        path.display(), e
                    );
                    continue;
                }
            };
            match serde_json::from_str::<QueuedAction>(&content) {
                Ok(action) => actions.push(action),
                Err(e) => warn!("Skipping corrupt action record {}: {}", path.display(), e),
            }
        }

        debug!(
            "Loaded {} action record(s) from {}",
            actions.len(), self.dir.display()
        );
        Ok(actions)
    }

    async fn put(&self, action: &QueuedAction) -> Result<()> {
        let path = self.record_path(action.id);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(action)?;

        let mut file = tokio::fs::File::create(&tmp).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, &content).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<()> {
        match tokio::fs::remove_file(self.record_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store. Clones share the same records, so a clone handed to a
/// second queue behaves like a reload of the first.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<HashMap<Uuid, QueuedAction>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ActionStore for MemoryStore {
    async fn load_all(&self) -> Result<Vec<QueuedAction>> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.values().cloned().collect())
    }

    async fn put(&self, action: &QueuedAction) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(action.id, action.clone());
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        Ok(())
    }
}
