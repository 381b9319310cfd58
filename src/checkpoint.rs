//! Checkpoint persistence for resuming after a restart.
//!
//! A checkpoint is the last watermark a publisher successfully forwarded,
//! keyed by publisher identity. The [`CheckpointStore`] trait is implemented
//! by the PostgreSQL table store ([`crate::postgres::PostgresStore`]), by
//! [`FileCheckpointStore`] for deployments that keep progress on local
//! disk, and by [`MemoryCheckpointStore`].
//!
//! # Example
//!
//! ```rust,no_run
//! use pg_publisher::checkpoint::{CheckpointStore, FileCheckpointStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = FileCheckpointStore::new("checkpoints.json");
//!
//!     match store.get("publisher-0").await {
//!         Ok(watermark) => println!("Resuming from {}", watermark),
//!         Err(e) if e.is_not_found() => println!("No checkpoint yet"),
//!         Err(e) => return Err(e.into()),
//!     }
//!
//!     store.set("publisher-0", 1234).await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::postgres::Watermark;
use crate::{Error, Result};

/// Durable record of the last published watermark per publisher identity.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Returns the stored watermark, or [`Error::NotFound`] if this
    /// publisher has never flushed one.
    async fn get(&self, id: &str) -> Result<Watermark>;

    /// Inserts or overwrites the watermark for `id`.
    ///
    /// Repeating a call with the same value is harmless.
    async fn set(&self, id: &str, watermark: Watermark) -> Result<()>;
}

/// A single checkpoint entry as persisted by [`FileCheckpointStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The last successfully published watermark
    pub watermark: Watermark,
    /// When this checkpoint was written
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Checkpoint {
    /// Creates a checkpoint stamped with the current time.
    ///
    /// ```rust
    /// use pg_publisher::checkpoint::Checkpoint;
    ///
    /// let checkpoint = Checkpoint::new(100);
    /// assert_eq!(checkpoint.watermark, 100);
    /// ```
    pub fn new(watermark: Watermark) -> Self {
        Self {
            watermark,
            timestamp: chrono::Utc::now(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CheckpointFile {
    checkpoints: BTreeMap<String, Checkpoint>,
}

/// Keeps checkpoints in a JSON file on local disk.
///
/// Writes are atomic: the whole document is written to a temporary file,
/// synced, and renamed over the previous version, so a crash mid-write
/// never leaves a truncated checkpoint behind.
pub struct FileCheckpointStore {
    file_path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCheckpointStore {
    pub fn new(checkpoint_path: impl AsRef<Path>) -> Self {
        Self {
            file_path: checkpoint_path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<CheckpointFile> {
        if !fs::try_exists(&self.file_path).await? {
            debug!("No checkpoint file found at {:?}", self.file_path);
            return Ok(CheckpointFile::default());
        }

        let content = fs::read_to_string(&self.file_path).await.map_err(|e| {
            error!("Failed to read checkpoint file: {}", e);
            Error::Io(e)
        })?;

        serde_json::from_str(&content).map_err(|e| {
            error!("Failed to parse checkpoint file {:?}: {}", self.file_path, e);
            Error::Serialization(e)
        })
    }

    async fn save(&self, document: &CheckpointFile) -> Result<()> {
        let temp_path = self.file_path.with_extension("tmp");

        let json = serde_json::to_string_pretty(document)?;
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.file_path).await?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get(&self, id: &str) -> Result<Watermark> {
        let document = self.load().await?;
        match document.checkpoints.get(id) {
            Some(checkpoint) => {
                info!(
                    id = %id,
                    watermark = checkpoint.watermark,
                    timestamp = %checkpoint.timestamp,
                    "Loaded checkpoint"
                );
                Ok(checkpoint.watermark)
            }
            None => Err(Error::NotFound {
                message: format!("no checkpoint for '{}' in {:?}", id, self.file_path),
            }),
        }
    }

    async fn set(&self, id: &str, watermark: Watermark) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        debug!(id = %id, watermark, "Saving checkpoint");
        let mut document = self.load().await?;
        document
            .checkpoints
            .insert(id.to_string(), Checkpoint::new(watermark));
        self.save(&document).await
    }
}

/// Process-local checkpoint store. Progress does not survive a restart.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<String, Watermark>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that already holds `watermark` for `id`.
    pub fn with_checkpoint(id: &str, watermark: Watermark) -> Self {
        let mut checkpoints = HashMap::new();
        checkpoints.insert(id.to_string(), watermark);
        Self {
            checkpoints: Mutex::new(checkpoints),
        }
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, id: &str) -> Result<Watermark> {
        self.checkpoints
            .lock()
            .await
            .get(id)
            .copied()
            .ok_or_else(|| Error::NotFound {
                message: format!("no checkpoint for '{}'", id),
            })
    }

    async fn set(&self, id: &str, watermark: Watermark) -> Result<()> {
        self.checkpoints.lock().await.insert(id.to_string(), watermark);
        Ok(())
    }
}
