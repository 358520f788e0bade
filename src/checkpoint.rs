//! Persisted flushed-LSN checkpoints.
//!
//! The streaming engine can record the last position the consumer
//! acknowledged as flushed, so that a restarted process resumes from there
//! instead of from the server's current WAL position.
//!
//! # Example
//!
//! ```rust,no_run
//! use pg_logical_cdc::checkpoint::{Checkpoint, CheckpointManager};
//! use pg_logical_cdc::Lsn;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = CheckpointManager::new("checkpoint.json");
//!
//!     if let Some(checkpoint) = manager.load().await? {
//!         println!("Resuming from LSN: {}", checkpoint.lsn);
//!     }
//!
//!     let checkpoint = Checkpoint::new(Lsn::parse("16/B374D848"), 100);
//!     manager.save(&checkpoint).await?;
//!
//!     Ok(())
//! }
//! ```

use crate::postgres::Lsn;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

/// A flushed position in the replication stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The last LSN the consumer reported as flushed
    pub lsn: Lsn,
    /// When this checkpoint was written
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Number of changes delivered since startup
    pub change_count: u64,
}

impl Checkpoint {
    /// Creates a new checkpoint stamped with the current time.
    ///
    /// ```rust
    /// use pg_logical_cdc::checkpoint::Checkpoint;
    /// use pg_logical_cdc::Lsn;
    ///
    /// let checkpoint = Checkpoint::new(Lsn::parse("1234/5678"), 100);
    /// assert_eq!(checkpoint.lsn.to_string(), "1234/5678");
    /// assert_eq!(checkpoint.change_count, 100);
    /// ```
    pub fn new(lsn: Lsn, change_count: u64) -> Self {
        Self {
            lsn,
            timestamp: chrono::Utc::now(),
            change_count,
        }
    }
}

/// Reads and atomically writes a [`Checkpoint`] file.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    file_path: PathBuf,
}

impl CheckpointManager {
    pub fn new(checkpoint_path: impl AsRef<Path>) -> Self {
        Self {
            file_path: checkpoint_path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// Loads the checkpoint, or `None` when no file exists yet.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file exists but cannot be read, or does not
    /// hold a valid checkpoint.
    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        if !fs::try_exists(&self.file_path).await? {
            debug!("No checkpoint file found at {:?}", self.file_path);
            return Ok(None);
        }

        let content = fs::read_to_string(&self.file_path).await.map_err(|e| {
            error!("Failed to read checkpoint file: {}", e);
            Error::Io(e)
        })?;

        match serde_json::from_str::<Checkpoint>(&content) {
            Ok(checkpoint) => {
                info!(
                    "Loaded checkpoint: LSN={}, timestamp={}",
                    checkpoint.lsn, checkpoint.timestamp
                );
                Ok(Some(checkpoint))
            }
            Err(e) => {
                error!("Failed to parse checkpoint file: {}", e);
                Err(Error::Config(format!(
                    "Invalid checkpoint file {:?}: {}",
                    self.file_path, e
                )))
            }
        }
    }

    /// Saves the checkpoint through a synced temporary file and a rename,
    /// so the file on disk is always either the old or the new checkpoint.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        debug!("Saving checkpoint: LSN={}", checkpoint.lsn);

        let temp_path = self.file_path.with_extension("tmp");

        let json = serde_json::to_string_pretty(checkpoint)?;
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.file_path).await?;
        Ok(())
    }

    /// Deletes the checkpoint file if it exists.
    pub async fn delete(&self) -> Result<()> {
        if fs::try_exists(&self.file_path).await? {
            fs::remove_file(&self.file_path).await?;
            info!("Deleted checkpoint file");
        }
        Ok(())
    }
}
