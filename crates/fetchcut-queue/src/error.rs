//! Queue error types.

use thiserror::Error;

use fetchcut_models::{JobId, JobState};

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Cannot {action} job {id} in state {state}")]
    InvalidTransition {
        id: JobId,
        state: JobState,
        action: &'static str,
    },

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueueError {
    pub fn invalid_transition(id: JobId, state: JobState, action: &'static str) -> Self {
        Self::InvalidTransition { id, state, action }
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }
}

/// How a claimed job's execution ended, as reported by the runner.
#[derive(Debug, Error)]
pub enum JobRunError {
    #[error("Job cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

impl JobRunError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}
