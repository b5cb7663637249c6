//! File persistent storage
//!
//! Persists cluster metadata snapshots to files

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

use crate::metadata::{ClusterMetadata, SNAPSHOT_VERSION};

/// Storage error
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
    #[error("File not found: {0}")]
    NotFound(PathBuf),
}

/// On-disk snapshot envelope
#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    metadata: &'a ClusterMetadata,
}

#[derive(Deserialize)]
struct Snapshot {
    version: u32,
    metadata: serde_json::Value,
}

/// File storage
pub struct FileStorage {
    /// Data directory
    data_dir: PathBuf,
    /// Snapshot file path
    metadata_path: PathBuf,
}

impl FileStorage {
    /// Create file storage
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();
        let metadata_path = data_dir.join("tablet_metadata.json");
        Self {
            data_dir,
            metadata_path,
        }
    }

    /// Ensure data directory exists
    pub async fn ensure_dir(&self) -> Result<(), StorageError> {
        if !self.data_dir.exists() {
            fs::create_dir_all(&self.data_dir).await?;
            info!("Created data directory: {:?}", self.data_dir);
        }
        Ok(())
    }

    /// Load cluster metadata
    pub async fn load(&self) -> Result<Option<ClusterMetadata>, StorageError> {
        if !self.metadata_path.exists() {
            info!("Metadata file not found, will create new cluster");
            return Ok(None);
        }

        let content = fs::read_to_string(&self.metadata_path).await?;
        let snapshot: Snapshot = serde_json::from_str(&content)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        if snapshot.version > SNAPSHOT_VERSION {
            return Err(StorageError::UnsupportedVersion(snapshot.version));
        }
        let metadata = ClusterMetadata::load(snapshot.metadata, snapshot.version)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        info!(
            "Loaded cluster metadata (version {}): {} cells, {} tables, {} tablets, {} actions",
            snapshot.version,
            metadata.cells.len(),
            metadata.tables.len(),
            metadata.tablets.len(),
            metadata.actions.len()
        );

        Ok(Some(metadata))
    }

    /// Save cluster metadata
    pub async fn save(&self, metadata: &ClusterMetadata) -> Result<(), StorageError> {
        self.ensure_dir().await?;

        // Write to temp file first, then atomically rename
        let temp_path = self.metadata_path.with_extension("json.tmp");
        let snapshot = SnapshotRef {
            version: SNAPSHOT_VERSION,
            metadata,
        };
        let content = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        fs::write(&temp_path, &content).await?;
        fs::rename(&temp_path, &self.metadata_path).await?;

        info!("Saved cluster metadata: revision {}", metadata.revision);

        Ok(())
    }

    /// Load or create cluster metadata
    pub async fn load_or_create(&self, cluster_name: &str) -> Result<ClusterMetadata, StorageError> {
        match self.load().await? {
            Some(metadata) => Ok(metadata),
            None => {
                let metadata = ClusterMetadata::new(cluster_name.to_string(), chrono::Utc::now());
                self.save(&metadata).await?;
                info!("Created new cluster '{}'", cluster_name);
                Ok(metadata)
            }
        }
    }

    /// Backup current snapshot
    pub async fn backup(&self) -> Result<PathBuf, StorageError> {
        if !self.metadata_path.exists() {
            return Err(StorageError::NotFound(self.metadata_path.clone()));
        }

        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let backup_path = self
            .data_dir
            .join(format!("tablet_metadata_{}.json.bak", timestamp));

        fs::copy(&self.metadata_path, &backup_path).await?;
        info!("Backed up metadata to {:?}", backup_path);

        Ok(backup_path)
    }
}
