//! Persisted "last completed phase" marker.

use crate::bootstrap::phase::Phase;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Last phase a run completed, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub phase: Phase,
    pub completed_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            completed_at: Utc::now(),
        }
    }
}

/// JSON checkpoint file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let checkpoint: Checkpoint = serde_json::from_slice(&bytes)?;
                debug!("Loaded checkpoint {:?} from {}", checkpoint, self.path.display());
                Ok(Some(checkpoint))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, phase: Phase) -> Result<Checkpoint> {
        let checkpoint = Checkpoint::new(phase);
        let json = serde_json::to_vec_pretty(&checkpoint)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, json).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;

        debug!("Checkpoint {} written to {}", phase, self.path.display());
        Ok(checkpoint)
    }

    /// Forget all progress. A missing file is not an error.
    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!("Removed checkpoint {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_checkpoint_is_none() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("progress.json"));
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_load_clear() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("nested").join("progress.json"));

        store.save(Phase::ConfigReplicaSetReady).await.unwrap();
        store.save(Phase::ShardNodesReachable).await.unwrap();
        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.phase, Phase::ShardNodesReachable);
        assert!(!store.path().with_extension("tmp").exists());

        store.clear().await.unwrap();
        assert_eq!(store.load().await.unwrap(), None);
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("progress.json");
        std::fs::write(&path, b"not json").unwrap();
        let err = CheckpointStore::new(path).load().await.unwrap_err();
        assert_eq!(err.kind(), "SerializationError");
    }
}
