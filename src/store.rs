//! Persistence backends for the follow registry.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::{fs, sync::Mutex};
use tracing::warn;

use crate::error::Result;
use crate::registry::Registry;

/// Loads and saves the whole registry.  `save` must be atomic for a single
/// process: a concurrent reader sees either the old or the new registry.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn load(&self) -> Result<Registry>;
    async fn save(&self, registry: &Registry) -> Result<()>;
}

// ---------------------------------------------------------------------------
// JSON file
// ---------------------------------------------------------------------------

/// Registry kept in a single JSON file.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RegistryStore for FileStore {
    async fn load(&self) -> Result<Registry> {
        if !fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(Registry::new());
        }
        let data = fs::read_to_string(&self.path).await?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Write to `<path>.tmp`, keep the previous file as `<path>.bak`, then
    /// rename the temp file into place.
    async fn save(&self, registry: &Registry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let json = serde_json::to_string_pretty(registry)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json.as_bytes()).await?;

        if fs::try_exists(&self.path).await.unwrap_or(false) {
            let bak = self.path.with_extension("json.bak");
            if let Err(e) = fs::copy(&self.path, &bak).await {
                warn!(path = %bak.display(), error = %e, "failed to back up registry");
            }
        }

        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In memory
// ---------------------------------------------------------------------------

/// Keeps the last saved registry in memory.
#[derive(Default)]
pub struct MemoryStore {
    saved: Mutex<Registry>,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an already populated registry.
    pub fn with_registry(registry: Registry) -> Self {
        Self {
            saved: Mutex::new(registry),
            saves: AtomicUsize::new(0),
        }
    }

    /// Number of completed saves.
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// The last saved registry.
    pub async fn current(&self) -> Registry {
        self.saved.lock().await.clone()
    }
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn load(&self) -> Result<Registry> {
        Ok(self.saved.lock().await.clone())
    }

    async fn save(&self, registry: &Registry) -> Result<()> {
        *self.saved.lock().await = registry.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
