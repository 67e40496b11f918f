//! # Snapshot Context Persistence
//!
//! Durable storage of [`SnapshotContext`]s so an interrupted incremental
//! snapshot resumes where it left off. One context per connector, stored as a
//! JSON file named after the connector.
//!
//! The window buffer is never stored. A restored context reverts its
//! in-flight chunk and reads it again (see [`SnapshotContext::prepare_resume`]).
//!
//! ```ignore
//! let store = ContextStore::new("/var/lib/snapshots").await?;
//! store.save("inventory", coordinator.snapshot_state().unwrap()).await?;
//!
//! // after restart
//! let restored = store.load("inventory").await?;
//! coordinator.init(restored).await?;
//! ```

use crate::common::{Result, SnapshotContext, SnapshotError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Storage backend for snapshot contexts.
#[async_trait]
pub trait ContextBackend: Send + Sync {
    async fn save(&self, key: &str, context: &SnapshotContext) -> Result<()>;
    async fn load(&self, key: &str) -> Result<Option<SnapshotContext>>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn list(&self) -> Result<Vec<String>>;
}

/// Shared context backend.
pub type SharedContextBackend = Arc<dyn ContextBackend>;

/// File-backed context store with atomic replace.
pub struct ContextStore {
    base_dir: PathBuf,
    cache: RwLock<HashMap<String, SnapshotContext>>,
    /// Whether to fsync after writes
    fsync: bool,
}

impl ContextStore {
    /// Open (and create) a store under `base_dir`, fsyncing every write.
    pub async fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(base_dir, true).await
    }

    pub async fn with_options(base_dir: impl AsRef<Path>, fsync: bool) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).await?;

        let store = Self {
            base_dir,
            cache: RwLock::new(HashMap::new()),
            fsync,
        };
        store.load_all().await?;
        Ok(store)
    }

    pub async fn save(&self, key: &str, context: &SnapshotContext) -> Result<()> {
        validate_key(key)?;

        let file_path = self.file_path(key);
        let temp_path = file_path.with_extension("tmp");
        let json = serde_json::to_string_pretty(context)
            .map_err(|e| SnapshotError::serialization(e.to_string()))?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await?;
        file.write_all(json.as_bytes()).await?;
        if self.fsync {
            file.sync_all().await?;
        }
        fs::rename(&temp_path, &file_path).await?;

        self.cache
            .write()
            .await
            .insert(key.to_string(), context.clone());

        debug!(
            key = key,
            snapshot_id = %context.snapshot_id,
            "Saved snapshot context"
        );
        Ok(())
    }

    pub async fn load(&self, key: &str) -> Result<Option<SnapshotContext>> {
        validate_key(key)?;
        if let Some(ctx) = self.cache.read().await.get(key) {
            return Ok(Some(ctx.clone()));
        }

        let file_path = self.file_path(key);
        if !file_path.exists() {
            return Ok(None);
        }

        let mut file = File::open(&file_path).await?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).await?;

        let context = SnapshotContext::from_json(&contents)
            .map_err(|e| SnapshotError::serialization(format!("context '{}': {}", key, e)))?;

        self.cache
            .write()
            .await
            .insert(key.to_string(), context.clone());
        Ok(Some(context))
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let file_path = self.file_path(key);
        if file_path.exists() {
            fs::remove_file(&file_path).await?;
        }
        self.cache.write().await.remove(key);

        info!(key = key, "Deleted snapshot context");
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<String>> {
        let mut keys: Vec<_> = self.cache.read().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn load_all(&self) -> Result<()> {
        let mut entries = fs::read_dir(&self.base_dir).await?;

        let mut loaded = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.extension().is_some_and(|e| e == "json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                match self.load(stem).await {
                    Ok(Some(_)) => loaded += 1,
                    Ok(None) => {}
                    Err(e) => warn!(key = stem, error = %e, "Failed to load snapshot context"),
                }
            }
        }

        if loaded > 0 {
            info!(
                count = loaded,
                dir = %self.base_dir.display(),
                "Loaded snapshot contexts"
            );
        }
        Ok(())
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", key))
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key == ".." || key.contains('/') || key.contains('\\') {
        return Err(SnapshotError::config(format!(
            "invalid context key '{}'",
            key
        )));
    }
    Ok(())
}

#[async_trait]
impl ContextBackend for ContextStore {
    async fn save(&self, key: &str, context: &SnapshotContext) -> Result<()> {
        ContextStore::save(self, key, context).await
    }

    async fn load(&self, key: &str) -> Result<Option<SnapshotContext>> {
        ContextStore::load(self, key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        ContextStore::delete(self, key).await
    }

    async fn list(&self) -> Result<Vec<String>> {
        ContextStore::list(self).await
    }
}

/// In-memory context store (tests, or when resume is not needed).
#[derive(Debug, Default)]
pub struct MemoryContextStore {
    contexts: RwLock<HashMap<String, SnapshotContext>>,
}

impl MemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContextBackend for MemoryContextStore {
    async fn save(&self, key: &str, context: &SnapshotContext) -> Result<()> {
        validate_key(key)?;
        self.contexts
            .write()
            .await
            .insert(key.to_string(), context.clone());
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<SnapshotContext>> {
        validate_key(key)?;
        Ok(self.contexts.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.contexts.write().await.remove(key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut keys: Vec<_> = self.contexts.read().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}
