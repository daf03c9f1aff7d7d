//! Interactive sessions.
//!
//! A session fronts the scheduler for a single interactive caller that
//! only ever wants one artifact at a time: submitting new work cancels
//! whatever the session was working on before.

use tokio::sync::Mutex;
use tracing::info;

use std::sync::Arc;

use fetchcut_models::{AcquisitionJob, JobId};
use fetchcut_queue::{QueueError, QueueResult, Scheduler};

pub struct InteractiveSession {
    scheduler: Arc<Scheduler>,
    active: Mutex<Option<JobId>>,
}

impl InteractiveSession {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            scheduler,
            active: Mutex::new(None),
        }
    }

    /// Submit new work, cancelling the session's previous job if it is
    /// still live. Returns the job now considered active (which may be a
    /// deduplicated existing one).
    pub async fn submit(&self, job: AcquisitionJob) -> QueueResult<AcquisitionJob> {
        let mut active = self.active.lock().await;

        if let Some(prev) = active.take() {
            if let Some(previous) = self.scheduler.get(&prev).await? {
                if !previous.state.is_terminal() {
                    info!(job_id = %prev, "New submission supersedes active job");
                    // Settled-in-the-meantime races are not errors here
                    let _ = self.scheduler.cancel(&prev).await;
                }
            }
        }

        let submitted = self.scheduler.submit(job).await?;
        let job = submitted.job().clone();
        *active = Some(job.id.clone());
        Ok(job)
    }

    /// Cancel the active job, if any. Returns the cancelled job's id, or
    /// `None` when there was nothing live to cancel.
    pub async fn cancel_active(&self) -> QueueResult<Option<JobId>> {
        let mut active = self.active.lock().await;
        let Some(id) = active.take() else {
            return Ok(None);
        };

        match self.scheduler.cancel(&id).await {
            Ok(()) => Ok(Some(id)),
            Err(QueueError::InvalidTransition { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Current state of the session's job.
    pub async fn active_job(&self) -> QueueResult<Option<AcquisitionJob>> {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(id) => self.scheduler.get(id).await,
            None => Ok(None),
        }
    }
}
