//! Crash-recovery snapshots.
//!
//! Job records and runner metadata are snapshotted as JSON under the state
//! directory so the engine can audit SLAs and rebuild its warm pool after a
//! restart. Snapshots are written atomically (temp file + rename).

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::Result;
use crate::pool::Runner;
use crate::scheduler::job::Job;

const JOBS_FILE: &str = "jobs.json";
const RUNNERS_FILE: &str = "runners.json";

pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    async fn write_atomic(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let tmp = self.dir.join(format!(".tmp-{}", Uuid::new_v4()));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, self.dir.join(name)).await?;
        Ok(())
    }

    async fn read_or_default<T: serde::de::DeserializeOwned + Default>(
        &self,
        name: &str,
    ) -> Result<T> {
        let path = self.dir.join(name);
        if !Path::new(&path).exists() {
            return Ok(T::default());
        }
        let bytes = tokio::fs::read(&path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn save_jobs(&self, jobs: &[Job]) -> Result<()> {
        self.write_atomic(JOBS_FILE, &serde_json::to_vec(jobs)?).await
    }

    pub async fn load_jobs(&self) -> Result<Vec<Job>> {
        self.read_or_default(JOBS_FILE).await
    }

    pub async fn save_runners(&self, runners: &[Runner]) -> Result<()> {
        self.write_atomic(RUNNERS_FILE, &serde_json::to_vec(runners)?)
            .await
    }

    pub async fn load_runners(&self) -> Result<Vec<Runner>> {
        self.read_or_default(RUNNERS_FILE).await
    }
}
