//! Queue scheduler.
//!
//! Claims pending jobs in FIFO order up to a concurrency ceiling and runs
//! each on its own task. Claims are serialized through the running-set
//! lock, so the two claim triggers (the periodic tick and the wake on
//! completion or submission) can never double-claim a job.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use fetchcut_models::{AcquisitionJob, ArtifactInfo, JobId, JobState, QueueStats};

use crate::error::{JobRunError, QueueError, QueueResult};
use crate::store::{stats_for, JobStore};

/// Executes one claimed job to completion.
///
/// The runner observes the cancel receiver and returns
/// [`JobRunError::Cancelled`] when it stopped because of it.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(
        &self,
        job: AcquisitionJob,
        cancel: watch::Receiver<bool>,
    ) -> Result<ArtifactInfo, JobRunError>;
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum jobs in RUNNING at once
    pub max_concurrent: usize,
    /// Fallback claim trigger
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// Result of a submit: either a freshly enqueued job or the live job
/// that already covers the same work.
#[derive(Debug, Clone)]
pub enum Submitted {
    New(AcquisitionJob),
    Existing(AcquisitionJob),
}

impl Submitted {
    pub fn job(&self) -> &AcquisitionJob {
        match self {
            Submitted::New(job) | Submitted::Existing(job) => job,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Submitted::New(_))
    }
}

pub struct Scheduler {
    store: Arc<dyn JobStore>,
    runner: Arc<dyn JobRunner>,
    config: SchedulerConfig,
    /// Running jobs and their cancel signals. Doubles as the claim lock.
    running: Mutex<HashMap<JobId, watch::Sender<bool>>>,
    /// Raised on submissions, retries, and completions
    wake: Notify,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        runner: Arc<dyn JobRunner>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            runner,
            config,
            running: Mutex::new(HashMap::new()),
            wake: Notify::new(),
        }
    }

    /// Enqueue a job, unless a non-failed job with the same dedup key
    /// already exists, in which case that job is returned instead.
    pub async fn submit(&self, job: AcquisitionJob) -> QueueResult<Submitted> {
        if let Some(existing) = self
            .store
            .find_active_by_dedup_key(&job.dedup_key)
            .await?
        {
            info!(
                job_id = %existing.id,
                dedup_key = %existing.dedup_key,
                "Duplicate submission collapsed onto existing job"
            );
            return Ok(Submitted::Existing(existing));
        }

        info!(job_id = %job.id, source = %job.identity, "Job enqueued");
        self.store.insert(job.clone()).await?;
        self.wake.notify_one();
        Ok(Submitted::New(job))
    }

    pub async fn get(&self, id: &JobId) -> QueueResult<Option<AcquisitionJob>> {
        self.store.get(id).await
    }

    pub async fn list(&self) -> QueueResult<Vec<AcquisitionJob>> {
        self.store.list().await
    }

    pub async fn stats(&self) -> QueueResult<QueueStats> {
        Ok(stats_for(&self.store.list().await?))
    }

    /// Position of a pending job in claim order, starting at 1 for the
    /// next job to be claimed. Informational only.
    pub async fn queue_position(&self, id: &JobId) -> QueueResult<Option<usize>> {
        let pending = self.pending_in_claim_order().await?;
        Ok(pending.iter().position(|j| &j.id == id).map(|p| p + 1))
    }

    /// Cancel a job. A running job is signalled and will settle as FAILED
    /// once its runner stops; a pending job fails immediately.
    pub async fn cancel(&self, id: &JobId) -> QueueResult<()> {
        {
            let running = self.running.lock().await;
            if let Some(tx) = running.get(id) {
                info!(job_id = %id, "Cancelling running job");
                let _ = tx.send(true);
                return Ok(());
            }
        }

        let job = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(id.clone()))?;

        match job.state {
            JobState::Pending => {
                info!(job_id = %id, "Cancelling pending job");
                self.store.update(job.fail("cancelled")).await
            }
            // Claimed but just finished; nothing left to stop.
            JobState::Running => Ok(()),
            state => Err(QueueError::invalid_transition(id.clone(), state, "cancel")),
        }
    }

    /// Re-enqueue a finished job. It queues behind currently pending work.
    pub async fn retry(&self, id: &JobId) -> QueueResult<AcquisitionJob> {
        let job = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(id.clone()))?;

        if !job.state.is_terminal() {
            return Err(QueueError::invalid_transition(
                id.clone(),
                job.state,
                "retry",
            ));
        }

        let job = job.reset_for_retry();
        info!(job_id = %id, "Job re-enqueued for retry");
        self.store.update(job.clone()).await?;
        self.wake.notify_one();
        Ok(job)
    }

    /// Claim pending jobs until the ceiling is reached or the queue is
    /// empty. Idempotent: triggering it with nothing to do is a no-op.
    pub async fn claim_next(self: &Arc<Self>) -> QueueResult<usize> {
        let mut claimed = 0;
        let mut running = self.running.lock().await;

        while running.len() < self.config.max_concurrent {
            let Some(job) = self.pending_in_claim_order().await?.into_iter().next()
            else {
                break;
            };

            let job = job.start();
            self.store.update(job.clone()).await?;

            let (cancel_tx, cancel_rx) = watch::channel(false);
            running.insert(job.id.clone(), cancel_tx);

            info!(job_id = %job.id, "Job claimed");
            let scheduler = self.clone();
            tokio::spawn(async move {
                scheduler.execute(job, cancel_rx).await;
            });
            claimed += 1;
        }

        Ok(claimed)
    }

    /// Settle jobs a previous process left RUNNING. Nothing is executing
    /// them anymore, so without this they could never be claimed,
    /// retried, or cancelled again.
    async fn recover_interrupted(&self) -> QueueResult<usize> {
        let running = self.running.lock().await;
        let mut recovered = 0;

        for job in self.store.list().await? {
            if job.state == JobState::Running && !running.contains_key(&job.id) {
                warn!(job_id = %job.id, "Failing job interrupted by restart");
                self.store.update(job.fail("interrupted by restart")).await?;
                recovered += 1;
            }
        }

        Ok(recovered)
    }

    /// Drive the scheduler until `shutdown` is raised. Running jobs are
    /// cancelled and awaited before returning.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.recover_interrupted().await {
            error!(error = %e, "Failed to recover interrupted jobs");
        }

        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if let Err(e) = self.claim_next().await {
                error!(error = %e, "Failed to claim next job");
            }

            tokio::select! {
                _ = tick.tick() => {}
                _ = self.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Scheduler shutting down");
        self.drain().await;
    }

    async fn pending_in_claim_order(&self) -> QueueResult<Vec<AcquisitionJob>> {
        let mut pending: Vec<AcquisitionJob> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|j| j.state == JobState::Pending)
            .collect();

        // FIFO by enqueue time; priority and id only break exact ties
        pending.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(b.priority.cmp(&a.priority))
                .then(a.id.as_str().cmp(b.id.as_str()))
        });

        Ok(pending)
    }

    async fn execute(self: Arc<Self>, job: AcquisitionJob, cancel: watch::Receiver<bool>) {
        let id = job.id.clone();
        let result = self.runner.run(job, cancel).await;

        // Re-read so progress written during the run is not clobbered
        let current = match self.store.get(&id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                error!(job_id = %id, "Job vanished from store while running");
                self.finish(&id).await;
                return;
            }
            Err(e) => {
                error!(job_id = %id, error = %e, "Failed to load job after run");
                self.finish(&id).await;
                return;
            }
        };

        let finished = match result {
            Ok(artifact) => {
                info!(
                    job_id = %id,
                    path = %artifact.path.display(),
                    size_bytes = artifact.size_bytes,
                    "Job completed"
                );
                current.complete(&artifact)
            }
            Err(JobRunError::Cancelled) => {
                info!(job_id = %id, "Job cancelled");
                current.fail("cancelled")
            }
            Err(JobRunError::Failed(msg)) => {
                warn!(job_id = %id, error = %msg, "Job failed");
                current.fail(msg)
            }
        };

        if let Err(e) = self.store.update(finished).await {
            error!(job_id = %id, error = %e, "Failed to persist job result");
        }

        self.finish(&id).await;
    }

    async fn finish(&self, id: &JobId) {
        self.running.lock().await.remove(id);
        self.wake.notify_one();
    }

    /// Signal every running job and wait for the set to empty.
    async fn drain(&self) {
        {
            let running = self.running.lock().await;
            for (id, tx) in running.iter() {
                info!(job_id = %id, "Cancelling job for shutdown");
                let _ = tx.send(true);
            }
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        while !self.running.lock().await.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                warn!("Running jobs did not settle before shutdown deadline");
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
