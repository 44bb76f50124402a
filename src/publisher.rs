//! Artifact publishing.
//!
//! Published artifacts are addressed purely by content hash: identical
//! outputs across jobs share one stored bundle, and downstream consumers can
//! skip redeploying a hash they have already seen.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::scheduler::changeset::TargetPlatform;

/// Content-hash reference to a published artifact.
pub type ArtifactRef = String;

/// The published output of a successful job. Immutable once published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub content_hash: ArtifactRef,
    pub job_id: Uuid,
    pub platform: TargetPlatform,
    pub location: PathBuf,
    pub size: u64,
    pub published_at: DateTime<Utc>,
}

pub struct ArtifactStore {
    dir: PathBuf,
    index: Mutex<HashMap<ArtifactRef, Artifact>>,
}

impl ArtifactStore {
    /// Open the store, rebuilding the index from metadata on disk.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let mut index = HashMap::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(file) = entries.next_entry().await? {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("meta") {
                continue;
            }
            if let Ok(bytes) = tokio::fs::read(&path).await {
                if let Ok(artifact) = serde_json::from_slice::<Artifact>(&bytes) {
                    index.insert(artifact.content_hash.clone(), artifact);
                }
            }
        }
        tracing::info!(dir = %dir.display(), artifacts = index.len(), "Artifact store opened");

        Ok(Self {
            dir,
            index: Mutex::new(index),
        })
    }

    /// Publish a bundle. Deduplicated by content hash: publishing identical
    /// bytes again returns the existing artifact's reference.
    pub async fn publish(
        &self,
        bundle: &[u8],
        job_id: Uuid,
        platform: TargetPlatform,
    ) -> Result<ArtifactRef> {
        let hash = hex::encode(Sha256::digest(bundle));

        {
            let index = self.index.lock().await;
            if let Some(existing) = index.get(&hash) {
                tracing::debug!(content_hash = %hash, job_id = %job_id, "Artifact deduplicated");
                return Ok(existing.content_hash.clone());
            }
        }

        let location = self.dir.join(format!("{hash}.bundle"));
        let tmp = self.dir.join(format!(".tmp-{}", Uuid::new_v4()));
        tokio::fs::write(&tmp, bundle).await?;
        tokio::fs::rename(&tmp, &location).await?;

        let artifact = Artifact {
            content_hash: hash.clone(),
            job_id,
            platform,
            location,
            size: bundle.len() as u64,
            published_at: Utc::now(),
        };
        tokio::fs::write(
            self.dir.join(format!("{hash}.meta")),
            serde_json::to_vec(&artifact)?,
        )
        .await?;

        let mut index = self.index.lock().await;
        index.entry(hash.clone()).or_insert(artifact);
        tracing::info!(content_hash = %hash, job_id = %job_id, platform = %platform, "Artifact published");
        Ok(hash)
    }

    pub async fn get(&self, artifact_ref: &str) -> Result<Artifact> {
        self.index
            .lock()
            .await
            .get(artifact_ref)
            .cloned()
            .ok_or_else(|| EngineError::ArtifactNotFound(artifact_ref.to_string()))
    }

    pub async fn len(&self) -> usize {
        self.index.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.lock().await.is_empty()
    }
}
