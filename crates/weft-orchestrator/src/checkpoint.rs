use crate::types::WorkflowError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use weft_core::{WeftError, WeftResult};

/// Persisted progress of one workflow, enough to resume it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub workflow_id: String,
    pub timestamp: DateTime<Utc>,
    pub completed_steps: Vec<String>,
    pub current_step: Option<String>,
    pub overall_progress: f64,
    pub errors: Vec<WorkflowError>,
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Create or overwrite the workflow's checkpoint.
    async fn save(&self, checkpoint: &Checkpoint) -> WeftResult<()>;
    async fn load(&self, workflow_id: &str) -> WeftResult<Option<Checkpoint>>;
    /// Returns whether a checkpoint existed.
    async fn delete(&self, workflow_id: &str) -> WeftResult<bool>;
    /// Ids of every stored workflow, sorted.
    async fn list(&self) -> WeftResult<Vec<String>>;
}

/// One JSON file per workflow under a directory.
///
/// Writes go to a temporary file that is renamed into place, so a crash
/// never leaves a half-written checkpoint behind.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub async fn new(dir: impl Into<PathBuf>) -> WeftResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn checkpoint_path(&self, workflow_id: &str) -> PathBuf {
        self.dir.join(checkpoint_file_name(workflow_id))
    }
}

/// File name for a workflow id: lowercase hex SHA-256 plus `.json`.
///
/// Ids are caller-chosen; hashing keeps every file inside the directory and
/// gives distinct ids distinct files.
pub fn checkpoint_file_name(workflow_id: &str) -> String {
    format!("{}.json", hex::encode(Sha256::digest(workflow_id.as_bytes())))
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> WeftResult<()> {
        let path = self.checkpoint_path(&checkpoint.workflow_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(checkpoint)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(
            workflow = %checkpoint.workflow_id,
            completed = checkpoint.completed_steps.len(),
            progress = checkpoint.overall_progress,
            "Checkpoint saved"
        );
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> WeftResult<Option<Checkpoint>> {
        let path = self.checkpoint_path(workflow_id);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let checkpoint: Checkpoint = serde_json::from_slice(&data).map_err(|e| {
            WeftError::Checkpoint(format!("Failed to parse {}: {e}", path.display()))
        })?;
        if checkpoint.workflow_id != workflow_id {
            warn!(
                path = %path.display(),
                expected = workflow_id,
                found = %checkpoint.workflow_id,
                "Checkpoint belongs to another workflow, ignoring it"
            );
            return Ok(None);
        }
        Ok(Some(checkpoint))
    }

    async fn delete(&self, workflow_id: &str) -> WeftResult<bool> {
        match tokio::fs::remove_file(self.checkpoint_path(workflow_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> WeftResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            // the id lives in the document, the file name is only its hash
            let data = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<Checkpoint>(&data) {
                Ok(checkpoint) => ids.push(checkpoint.workflow_id),
                Err(e) => debug!(path = %path.display(), error = %e, "Skipping unreadable checkpoint"),
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Process-local store, for tests and ephemeral runs.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> WeftResult<()> {
        self.checkpoints
            .write()
            .await
            .insert(checkpoint.workflow_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> WeftResult<Option<Checkpoint>> {
        Ok(self.checkpoints.read().await.get(workflow_id).cloned())
    }

    async fn delete(&self, workflow_id: &str) -> WeftResult<bool> {
        Ok(self.checkpoints.write().await.remove(workflow_id).is_some())
    }

    async fn list(&self) -> WeftResult<Vec<String>> {
        let mut ids: Vec<String> = self.checkpoints.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
