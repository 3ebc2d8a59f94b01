//! Filesystem artifact store
//!
//! Each artifact is one file named by a fresh UUID under the base directory.

use async_trait::async_trait;
use shared::{process_debug, ArtifactRef, ProcessId};
use std::path::PathBuf;
use tokio::fs;
use uuid::Uuid;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::traits::ArtifactStore;

pub struct FsArtifactStore {
    /// Directory holding all artifacts
    base_dir: PathBuf,
}

impl FsArtifactStore {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Path of a stored artifact
    ///
    /// References are always plain file names; anything else is rejected so
    /// a reference can never point outside the base directory.
    pub fn path_of(&self, artifact: &ArtifactRef) -> OrchestratorResult<PathBuf> {
        let name = artifact.as_str();
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(OrchestratorError::artifact_store("resolve", format!("invalid reference {name}")));
        }
        Ok(self.base_dir.join(name))
    }

    pub async fn read(&self, artifact: &ArtifactRef) -> OrchestratorResult<Vec<u8>> {
        let path = self.path_of(artifact)?;
        fs::read(&path)
            .await
            .map_err(|e| OrchestratorError::artifact_store("read", e))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn store(&self, bytes: Vec<u8>) -> OrchestratorResult<ArtifactRef> {
        fs::create_dir_all(&self.base_dir)
            .await
            .map_err(|e| OrchestratorError::artifact_store("create_dir", e))?;

        let reference = ArtifactRef::new(format!("{}.pdf", Uuid::new_v4()));
        let path = self.path_of(&reference)?;
        fs::write(&path, &bytes)
            .await
            .map_err(|e| OrchestratorError::artifact_store("write", e))?;

        process_debug!(ProcessId::current(), "💾 Stored artifact {} ({} bytes)", reference, bytes.len());
        Ok(reference)
    }

    async fn delete(&self, artifact: &ArtifactRef) -> OrchestratorResult<()> {
        let path = self.path_of(artifact)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            // Already gone: deletes are repeated by at-least-once cleanup
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(OrchestratorError::artifact_store("delete", e)),
        }
    }
}
