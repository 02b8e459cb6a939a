//! Persistence for relay progress and relay configuration.
//!
//! Both documents are small JSON files. Writes go to a sibling temp file that
//! is flushed and then renamed over the target, so a reader never sees a
//! partially written document.

use crate::relay_config::RelayConfig;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Errors that can occur while persisting a document
#[derive(Error, Debug)]
pub enum StorageError {
    /// Error during JSON serialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// Standard I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable record of forwarding progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Ordinal of the last forwarded message, `None` before the first forward.
    #[serde(default)]
    pub last_id: Option<i64>,
    /// Total number of messages forwarded.
    #[serde(default)]
    pub count: u64,
}

impl Checkpoint {
    /// Whether the message with this ordinal has already been handled.
    #[must_use]
    pub fn covers(&self, ordinal: i64) -> bool {
        self.last_id.is_some_and(|last| ordinal <= last)
    }

    /// Record one successful forward. The ordinal never moves backwards.
    pub fn advance(&mut self, ordinal: i64) {
        self.last_id = Some(self.last_id.map_or(ordinal, |last| last.max(ordinal)));
        self.count = self.count.saturating_add(1);
    }
}

/// Storage for the forwarding checkpoint
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the stored checkpoint; missing or unreadable data yields the zero value
    async fn load(&self) -> Checkpoint;
    /// Persist the checkpoint
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StorageError>;
}

/// Storage for the relay configuration
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RelayConfigStore: Send + Sync {
    /// Load the stored configuration; missing or unreadable data yields an empty config
    async fn load(&self) -> RelayConfig;
    /// Persist the configuration
    async fn save(&self, config: &RelayConfig) -> Result<(), StorageError>;
}

/// A single JSON document on disk.
#[derive(Debug, Clone)]
pub struct JsonDocument<T> {
    path: PathBuf,
    _doc: PhantomData<fn() -> T>,
}

/// File-backed checkpoint store.
pub type FileCheckpointStore = JsonDocument<Checkpoint>;
/// File-backed relay config store.
pub type FileRelayConfigStore = JsonDocument<RelayConfig>;

impl<T> JsonDocument<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    /// Create a store for the document at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _doc: PhantomData,
        }
    }

    /// Location of the document.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> T {
        let data = match fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Document not found, using defaults");
                return T::default();
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read document, using defaults");
                return T::default();
            }
        };

        serde_json::from_str(&data).unwrap_or_else(|e| {
            warn!(path = %self.path.display(), error = %e, "Corrupt document, using defaults");
            T::default()
        })
    }

    async fn write(&self, value: &T) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let json = serde_json::to_vec_pretty(value)?;
        let tmp = self.path.with_extension("json.tmp");

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for JsonDocument<Checkpoint> {
    async fn load(&self) -> Checkpoint {
        self.read().await
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        self.write(checkpoint).await
    }
}

#[async_trait]
impl RelayConfigStore for JsonDocument<RelayConfig> {
    async fn load(&self) -> RelayConfig {
        self.read().await
    }

    async fn save(&self, config: &RelayConfig) -> Result<(), StorageError> {
        self.write(config).await
    }
}
