//! Job store contract and the in-memory implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use fetchcut_models::{AcquisitionJob, JobId, JobState, QueueStats};

use crate::error::{QueueError, QueueResult};

/// Persistence seam for acquisition jobs.
///
/// Implementations must make `insert` and `update` visible to subsequent
/// reads from any task.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: AcquisitionJob) -> QueueResult<()>;

    /// Replace the stored job with the same id.
    async fn update(&self, job: AcquisitionJob) -> QueueResult<()>;

    async fn get(&self, id: &JobId) -> QueueResult<Option<AcquisitionJob>>;

    /// Find a non-failed job with this dedup key, if any. Failed jobs do
    /// not block resubmission.
    async fn find_active_by_dedup_key(&self, key: &str)
        -> QueueResult<Option<AcquisitionJob>>;

    /// All jobs, in no particular order.
    async fn list(&self) -> QueueResult<Vec<AcquisitionJob>>;
}

/// Occupancy snapshot over a job list.
pub fn stats_for(jobs: &[AcquisitionJob]) -> QueueStats {
    let mut stats = QueueStats {
        total: jobs.len(),
        ..QueueStats::default()
    };
    for job in jobs {
        match job.state {
            JobState::Pending => stats.pending += 1,
            JobState::Running => stats.running += 1,
            JobState::Done => stats.done += 1,
            JobState::Failed => stats.failed += 1,
        }
    }
    stats
}

/// Volatile store for tests and one-shot interactive runs.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, AcquisitionJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: AcquisitionJob) -> QueueResult<()> {
        self.jobs.write().await.insert(job.id.clone(), job);
        Ok(())
    }

    async fn update(&self, job: AcquisitionJob) -> QueueResult<()> {
        let mut jobs = self.jobs.write().await;
        if !jobs.contains_key(&job.id) {
            return Err(QueueError::JobNotFound(job.id));
        }
        jobs.insert(job.id.clone(), job);
        Ok(())
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
