//! Acquisition jobs and their lifecycle.
//!
//! A job is the persisted, schedulable unit of acquisition+composition
//! work. Once enqueued it is owned by the scheduler: every state change
//! goes through the transition methods here, never through field pokes
//! scattered around the codebase.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::SourceIdentity;
use crate::segment::SegmentList;

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job state in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to be claimed
    #[default]
    Pending,
    /// Claimed and executing
    Running,
    /// Finished successfully
    Done,
    /// Finished with an error (or cancelled)
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Done => "done",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Metadata of a produced output artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactInfo {
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// A persisted acquisition+composition job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionJob {
    /// Unique job ID
    pub id: JobId,

    /// What to acquire
    pub identity: SourceIdentity,

    /// Validated cut list (empty = whole source)
    pub segments: SegmentList,

    /// Where the final artifact goes
    pub destination: PathBuf,

    /// Current state
    #[serde(default)]
    pub state: JobState,

    /// Scheduling priority; only breaks ties between equal enqueue times
    #[serde(default)]
    pub priority: i32,

    /// Creation timestamp (doubles as enqueue time for FIFO ordering)
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Progress (0-100)
    #[serde(default)]
    pub progress_percent: u8,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_size: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Identity + segment bounds, used for duplicate-submission detection
    pub dedup_key: String,
}

impl AcquisitionJob {
    pub fn new(
        identity: SourceIdentity,
        segments: SegmentList,
        destination: impl Into<PathBuf>,
    ) -> Self {
        let now = Utc::now();
        let dedup_key = Self::dedup_key_for(&identity, &segments);

        Self {
            id: JobId::new(),
            identity,
            segments,
            destination: destination.into(),
            state: JobState::Pending,
            priority: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            progress_percent: 0,
            result_path: None,
            result_size: None,
            error_message: None,
            dedup_key,
        }
    }

    /// Dedup key shared by all jobs with the same identity and bounds.
    pub fn dedup_key_for(identity: &SourceIdentity, segments: &SegmentList) -> String {
        format!("{}#{}", identity.cache_key(), segments.bounds_key())
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Transition to RUNNING (a successful claim).
    pub fn start(mut self) -> Self {
        self.state = JobState::Running;
        self.started_at = Some(Utc::now());
        self.updated_at = Utc::now();
        self
    }

    /// Transition to DONE with the produced artifact.
    pub fn complete(mut self, artifact: &ArtifactInfo) -> Self {
        self.state = JobState::Done;
        self.result_path = Some(artifact.path.clone());
        self.result_size = Some(artifact.size_bytes);
        self.progress_percent = 100;
        self.finished_at = Some(Utc::now());
        self.updated_at = Utc::now();
        self
    }

    /// Transition to FAILED with a human-readable message.
    pub fn fail(mut self, error: impl Into<String>) -> Self {
        self.state = JobState::Failed;
        self.error_message = Some(error.into());
        self.finished_at = Some(Utc::now());
        self.updated_at = Utc::now();
        self
    }

    /// Reset a finished job back to PENDING for a retry.
    ///
    /// Clears prior result and error fields and re-stamps the enqueue
    /// time so the job queues behind work submitted in the meantime.
    pub fn reset_for_retry(mut self) -> Self {
        self.state = JobState::Pending;
        self.started_at = None;
        self.finished_at = None;
        self.progress_percent = 0;
        self.result_path = None;
        self.result_size = None;
        self.error_message = None;
        self.created_at = Utc::now();
        self.updated_at = self.created_at;
        self
    }

    /// Update progress (clamped to 100).
    pub fn with_progress(mut self, percent: u8) -> Self {
        self.progress_percent = percent.min(100);
        self.updated_at = Utc::now();
        self
    }
}

/// Snapshot of queue occupancy by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
}
