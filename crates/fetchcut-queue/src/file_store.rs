//! JSON-file backed job store.
//!
//! The whole job table is held in memory and snapshotted to a single
//! JSON file after every mutation. Writes go to a temp file in the same
//! directory followed by a rename, so a crash mid-write leaves the
//! previous snapshot intact.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use fetchcut_models::{AcquisitionJob, JobId, JobState};

use crate::error::{QueueError, QueueResult};
use crate::store::JobStore;

pub struct JsonFileStore {
    path: PathBuf,
    jobs: RwLock<HashMap<JobId, AcquisitionJob>>,
}

impl JsonFileStore {
    /// Open the store at `path`, creating parent directories as needed.
    /// A missing file is an empty store; a present file is loaded fully.
    pub async fn open(path: impl AsRef<Path>) -> QueueResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let jobs = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let list: Vec<AcquisitionJob> = serde_json::from_slice(&bytes)?;
                info!(path = %path.display(), jobs = list.len(), "Loaded job store");
                list.into_iter().map(|j| (j.id.clone(), j)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Starting with empty job store");
                HashMap::new()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            jobs: RwLock::new(jobs),
        })
    }

    /// Snapshot the current table to disk. Callers must hold at least a
    /// read lock to keep the snapshot consistent with what they mutated.
    async fn persist(&self, jobs: &HashMap<JobId, AcquisitionJob>) -> QueueResult<()> {
        let mut list: Vec<&AcquisitionJob> = jobs.values().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let bytes = serde_json::to_vec_pretty(&list)?;
        let tmp = self.path.with_extension("json.tmp");

        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for JsonFileStore {
    async fn insert(&self, job: AcquisitionJob) -> QueueResult<()> {
        let mut jobs = self.jobs.write().await;
        jobs.insert(job.id.clone(), job);
        self.persist(&jobs).await
    }

    async fn update(&self, job: AcquisitionJob) -> QueueResult<()> {
        let mut jobs = self.jobs.write().await;
        if !jobs.contains_key(&job.id) {
            return Err(QueueError::JobNotFound(job.id));
        }
        jobs.insert(job.id.clone(), job);
        self.persist(&jobs).await
    }

    async fn get(&self, id: &JobId) -> QueueResult<Option<AcquisitionJob>> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn find_active_by_dedup_key(
        &self,
        key: &str,
    ) -> QueueResult<Option<AcquisitionJob>> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .find(|j| j.dedup_key == key && j.state != JobState::Failed)
            .cloned())
    }

    async fn list(&self) -> QueueResult<Vec<AcquisitionJob>> {
        Ok(self.jobs.read().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fetchcut_models::{SegmentList, SourceIdentity};
    use tempfile::TempDir;

    fn job(locator: &str) -> AcquisitionJob {
        AcquisitionJob::new(
            SourceIdentity::remote(locator),
            SegmentList::empty(),
            "/out/a.mp4",
        )
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state/jobs.json");

        let a = job("https://a");
        let b = job("https://b").start();
        {
            let store = JsonFileStore::open(&path).await.unwrap();
            store.insert(a.clone()).await.unwrap();
            store.insert(b.clone()).await.unwrap();
        }

        let reopened = JsonFileStore::open(&path).await.unwrap();
        let loaded = reopened.get(&a.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Pending);
        let loaded = reopened.get(&b.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Running);
        assert_eq!(reopened.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn missing_file_is_an_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path().join("jobs.json"))
            .await
            .unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_persists_state_changes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.json");

        let j = job("https://a");
        let id = j.id.clone();
        {
            let store = JsonFileStore::open(&path).await.unwrap();
            store.insert(j.clone()).await.unwrap();
            store.update(j.start().fail("network down")).await.unwrap();
        }

        let reopened = JsonFileStore::open(&path).await.unwrap();
        let loaded = reopened.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Failed);
        assert_eq!(loaded.error_message.as_deref(), Some("network down"));
    }

    #[tokio::test]
    async fn no_temp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.json");

        let store = JsonFileStore::open(&path).await.unwrap();
        store.insert(job("https://a")).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["jobs.json".to_string()]);
    }
}
