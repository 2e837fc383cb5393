//! Resume-token checkpoints.
//!
//! A checkpoint records the feed position of the last record delivered
//! for a collection. When a [`CheckpointStore`] is configured, each feed
//! resumes from its checkpoint on start instead of from "now", so
//! mutations made while the process was down are still audited.
//!
//! Implementations:
//!
//! - [`MemoryCheckpointStore`]: process-local, for tests
//! - [`FileCheckpointStore`]: one JSON file of `collection -> token`

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use changewatch_core::ResumeToken;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{CaptureError, CaptureResult};

/// File name used inside the checkpoint directory.
pub const CHECKPOINT_FILE: &str = "checkpoints.json";

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Persistent storage for per-collection resume tokens.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// The stored token for `collection`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::Checkpoint`] if the store cannot be read.
    async fn load(&self, collection: &str) -> CaptureResult<Option<ResumeToken>>;

    /// Store `token` as the position of `collection`.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::Checkpoint`] if the store cannot be written.
    async fn save(&self, collection: &str, token: &ResumeToken) -> CaptureResult<()>;
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Process-local checkpoint store.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    tokens: std::sync::RwLock<BTreeMap<String, ResumeToken>>,
}

impl MemoryCheckpointStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, collection: &str) -> CaptureResult<Option<ResumeToken>> {
        let tokens = self
            .tokens
            .read()
            .map_err(|e| CaptureError::Checkpoint(e.to_string()))?;
        Ok(tokens.get(collection).cloned())
    }

    async fn save(&self, collection: &str, token: &ResumeToken) -> CaptureResult<()> {
        let mut tokens = self
            .tokens
            .write()
            .map_err(|e| CaptureError::Checkpoint(e.to_string()))?;
        tokens.insert(collection.to_owned(), token.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File
// ---------------------------------------------------------------------------

/// Checkpoints stored as a JSON object in `<dir>/checkpoints.json`.
///
/// Writes go to a temporary file that is then renamed over the old one,
/// so a crash mid-write leaves the previous checkpoints intact. Saves are
/// serialized within the process.
#[derive(Debug)]
pub struct FileCheckpointStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCheckpointStore {
    /// Create a store in `dir`. The directory is created on first save.
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(CHECKPOINT_FILE),
            write_lock: Mutex::new(()),
        }
    }

    /// Path of the checkpoint file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> CaptureResult<BTreeMap<String, ResumeToken>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(CaptureError::Checkpoint(format!(
                "failed to read {}: {e}",
                self.path.display()
            ))),
        }
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, collection: &str) -> CaptureResult<Option<ResumeToken>> {
        Ok(self.read_all().await?.remove(collection))
    }

    async fn save(&self, collection: &str, token: &ResumeToken) -> CaptureResult<()> {
        let _guard = self.write_lock.lock().await;

        let mut tokens = self.read_all().await?;
        tokens.insert(collection.to_owned(), token.clone());
        let bytes = serde_json::to_vec_pretty(&tokens)?;

        let io_err = |e: std::io::Error| {
            CaptureError::Checkpoint(format!("failed to write {}: {e}", self.path.display()))
        };
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)?;

        debug!(collection, path = %self.path.display(), "Checkpoint saved");
        Ok(())
    }
}
