//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrent jobs
    pub max_concurrent_jobs: usize,
    /// Scratch directory for fetched sources and intermediate cuts
    pub work_dir: PathBuf,
    /// Root directory all artifact destinations must resolve under
    pub output_dir: PathBuf,
    /// Path of the persistent job store
    pub state_file: PathBuf,
    /// Per-fetch timeout
    pub fetch_timeout: Duration,
    /// Per-transcode timeout
    pub transcode_timeout: Duration,
    /// How often the scheduler re-checks for claimable jobs
    pub claim_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            work_dir: PathBuf::from("/tmp/fetchcut"),
            output_dir: PathBuf::from("/tmp/fetchcut/output"),
            state_file: PathBuf::from("/tmp/fetchcut/jobs.json"),
            fetch_timeout: Duration::from_secs(3600),
            transcode_timeout: Duration::from_secs(1800),
            claim_interval: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            max_concurrent_jobs: std::env::var("WORKER_MAX_JOBS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(2),
            work_dir: std::env::var("WORKER_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/tmp/fetchcut")),
            output_dir: std::env::var("WORKER_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/tmp/fetchcut/output")),
            state_file: std::env::var("WORKER_STATE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/tmp/fetchcut/jobs.json")),
            fetch_timeout: Duration::from_secs(
                std::env::var("WORKER_FETCH_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(3600),
            ),
            transcode_timeout: Duration::from_secs(
                std::env::var("WORKER_TRANSCODE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1800),
            ),
            claim_interval: Duration::from_secs(
                std::env::var("WORKER_CLAIM_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = WorkerConfig::default();
        assert_eq!(config.max_concurrent_jobs, 2);
        assert!(config.fetch_timeout > config.claim_interval);
    }
}
