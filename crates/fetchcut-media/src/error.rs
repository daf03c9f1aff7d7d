//! Error types for acquisition and composition.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for acquisition operations.
pub type AcquireResult<T> = Result<T, AcquisitionError>;

/// Result type for composition operations.
pub type ComposeResult<T> = Result<T, CompositionError>;

/// Tooling problems detected before any work starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} not found in PATH")]
    ToolNotFound(&'static str),
}

/// Broad classification of a failed fetch, derived from tool output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchFailureKind {
    /// The remote service throttled or blocked us
    RateLimited,
    /// The source does not exist or was taken down
    Unavailable,
    /// The source exists but requires credentials or is region-locked
    Restricted,
    /// Connectivity problem between us and the service
    Network,
    /// Anything the output did not let us classify
    Unknown,
}

impl FetchFailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchFailureKind::RateLimited => "rate_limited",
            FetchFailureKind::Unavailable => "unavailable",
            FetchFailureKind::Restricted => "restricted",
            FetchFailureKind::Network => "network",
            FetchFailureKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for FetchFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors that can occur while acquiring a source.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Fetch failed ({kind}): {message}")]
    FetchFailed {
        kind: FetchFailureKind,
        message: String,
    },

    #[error("Malformed fetch result: {0}")]
    MalformedResult(String),

    #[error("Invalid source locator: {0}")]
    InvalidLocator(String),

    #[error("Source not readable: {0}")]
    SourceNotReadable(PathBuf),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AcquisitionError {
    /// Create a fetch failure with its classification.
    pub fn fetch_failed(kind: FetchFailureKind, message: impl Into<String>) -> Self {
        Self::FetchFailed {
            kind,
            message: message.into(),
        }
    }

    /// Create a malformed-result error.
    pub fn malformed_result(message: impl Into<String>) -> Self {
        Self::MalformedResult(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Errors that can occur while composing an artifact from a source.
#[derive(Debug, Error)]
pub enum CompositionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Transcode failed during {stage}: {message}")]
    TranscodeFailed {
        stage: &'static str,
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    #[error("Output path rejected: {0}")]
    SandboxViolation(String),

    #[error("Output file missing after transcode: {0}")]
    OutputMissing(PathBuf),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CompositionError {
    /// Create a transcode failure error.
    pub fn transcode_failed(
        stage: &'static str,
        message: impl Into<String>,
        stderr: Option<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Self::TranscodeFailed {
            stage,
            message: message.into(),
            stderr,
            exit_code,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
