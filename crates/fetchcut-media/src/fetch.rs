//! Source fetching via yt-dlp.
//!
//! The fetcher runs yt-dlp as a child process with a machine-readable
//! progress template on stderr and the final file path printed on stdout.
//! Progress lines that do not decode are treated as tool noise and dropped;
//! a missing result line on a successful exit is a malformed payload, not
//! a silent success.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use fetchcut_models::SourceIdentity;

use crate::error::{AcquireResult, AcquisitionError, ConfigError, FetchFailureKind};
use crate::relay::{ProgressEvent, ProgressRelay, ProgressStage};

/// How many trailing stderr lines to keep for failure classification.
const STDERR_TAIL_LINES: usize = 200;

/// Seconds to wait for the child to exit on its own after a cancel
/// before hard-killing it.
const DEFAULT_KILL_GRACE_SECS: u64 = 5;

/// Progress template rendered by yt-dlp as one JSON object per line.
const PROGRESS_TEMPLATE: &str = concat!(
    "{\"percent\":%(progress._percent_str)j,",
    "\"downloaded_bytes\":%(progress.downloaded_bytes)j,",
    "\"total_bytes\":%(progress.total_bytes)j,",
    "\"speed\":%(progress.speed)j,",
    "\"eta\":%(progress.eta)j}"
);

/// The fetched file as reported by the tool.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// Final path after any container merge or move
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Fetches a remote source to local disk.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(
        &self,
        identity: &SourceIdentity,
        destination: &Path,
        job_id: &str,
        relay: &ProgressRelay,
        cancel: watch::Receiver<bool>,
    ) -> AcquireResult<FetchOutcome>;
}

/// Raw progress fields as rendered by [`PROGRESS_TEMPLATE`].
#[derive(Debug, Deserialize)]
struct RawFetchProgress {
    percent: Option<String>,
    downloaded_bytes: Option<f64>,
    total_bytes: Option<f64>,
    speed: Option<f64>,
    eta: Option<f64>,
}

/// Parse one stderr line into a normalized event.
///
/// Returns `None` for anything that is not a decodable progress object.
pub fn parse_progress_line(job_id: &str, line: &str) -> Option<ProgressEvent> {
    let raw: RawFetchProgress = serde_json::from_str(line.trim()).ok()?;

    let downloaded = raw.downloaded_bytes.filter(|v| *v >= 0.0).map(|v| v as u64);
    let total = raw.total_bytes.filter(|v| *v > 0.0).map(|v| v as u64);

    // Prefer the rendered percent string; fall back to a byte ratio.
    let percent = raw
        .percent
        .as_deref()
        .and_then(|s| s.trim().trim_end_matches('%').trim().parse::<f64>().ok())
        .or_else(|| match (downloaded, total) {
            (Some(d), Some(t)) => Some(d as f64 / t as f64 * 100.0),
            _ => None,
        })?;

    let mut event = ProgressEvent::new(job_id, ProgressStage::Fetching, percent);
    event.downloaded_bytes = downloaded;
    event.total_bytes = total;
    event.speed = raw.speed.filter(|v| *v > 0.0);
    event.eta_seconds = raw.eta.filter(|v| *v >= 0.0).map(|v| v as u64);
    Some(event)
}

/// Classify a failed fetch from the tool's stderr.
pub fn classify_fetch_failure(stderr: &str) -> FetchFailureKind {
    let lower = stderr.to_lowercase();

    if lower.contains("429")
        || lower.contains("too many requests")
        || lower.contains("rate limit")
        || lower.contains("sign in to confirm")
    {
        FetchFailureKind::RateLimited
    } else if lower.contains("video unavailable")
        || lower.contains("404")
        || lower.contains("has been removed")
        || lower.contains("does not exist")
    {
        FetchFailureKind::Unavailable
    } else if lower.contains("private video")
        || lower.contains("members-only")
        || lower.contains("login required")
        || lower.contains("age-restricted")
        || lower.contains("not available in your country")
    {
        FetchFailureKind::Restricted
    } else if lower.contains("unable to connect")
        || lower.contains("connection refused")
        || lower.contains("connection reset")
        || lower.contains("timed out")
        || lower.contains("temporary failure in name resolution")
        || lower.contains("getaddrinfo")
    {
        FetchFailureKind::Network
    } else {
        FetchFailureKind::Unknown
    }
}

enum WaitEvent {
    Exited(std::io::Result<std::process::ExitStatus>),
    Cancelled,
    TimedOut,
}

/// yt-dlp backed [`SourceFetcher`].
pub struct YtDlpFetcher {
    format: String,
    timeout_secs: Option<u64>,
    kill_grace_secs: u64,
}

impl YtDlpFetcher {
    pub fn new() -> Self {
        Self {
            format: "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best".to_string(),
            timeout_secs: None,
            kill_grace_secs: DEFAULT_KILL_GRACE_SECS,
        }
    }

    /// Override the yt-dlp format selector.
    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self
    }

    /// Abort a fetch that runs longer than this.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_kill_grace(mut self, secs: u64) -> Self {
        self.kill_grace_secs = secs;
        self
    }

    fn build_args(&self, locator: &str, destination: &Path) -> Vec<String> {
        // --quiet routes the progress template to stderr, leaving stdout
        // to the --print result line alone.
        vec![
            "--quiet".to_string(),
            "--progress".to_string(),
            "--newline".to_string(),
            "--no-playlist".to_string(),
            "--progress-template".to_string(),
            PROGRESS_TEMPLATE.to_string(),
            "--print".to_string(),
            "after_move:filepath".to_string(),
            "--no-simulate".to_string(),
            "-f".to_string(),
            self.format.clone(),
            "-o".to_string(),
            destination.to_string_lossy().to_string(),
            locator.to_string(),
        ]
    }

    async fn wait_for_completion(
        &self,
        child: &mut Child,
        mut cancel: watch::Receiver<bool>,
    ) -> AcquireResult<std::process::ExitStatus> {
        let wait = async {
            tokio::select! {
                status = child.wait() => WaitEvent::Exited(status),
                _ = crate::cancel::cancel_requested(&mut cancel) => WaitEvent::Cancelled,
            }
        };

        let event = match self.timeout_secs {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), wait)
                .await
                .unwrap_or(WaitEvent::TimedOut),
            None => wait.await,
        };

        match event {
            WaitEvent::Exited(status) => Ok(status?),
            WaitEvent::Cancelled => {
                info!("Fetch cancelled, stopping yt-dlp");
                crate::cancel::request_stop(child);
                let grace = Duration::from_secs(self.kill_grace_secs);
                if tokio::time::timeout(grace, child.wait()).await.is_err() {
                    warn!("yt-dlp did not exit within grace period, killing");
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                }
                Err(AcquisitionError::Cancelled)
            }
            WaitEvent::TimedOut => {
                let secs = self.timeout_secs.unwrap_or(0);
                warn!("yt-dlp timed out after {} seconds, killing", secs);
                let _ = child.kill().await;
                let _ = child.wait().await;
                Err(AcquisitionError::Timeout(secs))
            }
        }
    }
}

impl Default for YtDlpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Check if yt-dlp is available.
pub fn check_ytdlp() -> Result<PathBuf, ConfigError> {
    which::which("yt-dlp").map_err(|_| ConfigError::ToolNotFound("yt-dlp"))
}

/// Remove partial artifacts of an interrupted fetch. Best effort.
///
/// The output template leaves yt-dlp free to substitute the container
/// extension, so an interrupted run can strand `<stem>.mp4`,
/// `<stem>.mp4.part`, or format-suffixed fragments next to the template
/// path. Everything in the destination directory sharing the template's
/// stem is swept.
async fn cleanup_partial(destination: &Path) {
    let Some(parent) = destination.parent() else {
        return;
    };
    let Some(name) = destination.file_name().and_then(|n| n.to_str()) else {
        return;
    };
    // Strip a `%(...)s` template tail; a plain path keeps its full name.
    let stem = name.split_once("%(").map_or(name, |(head, _)| head);
    if stem.is_empty() {
        return;
    }

    let Ok(mut entries) = tokio::fs::read_dir(parent).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if file_name.starts_with(stem) && tokio::fs::remove_file(entry.path()).await.is_ok() {
            debug!("Removed partial fetch file: {}", entry.path().display());
        }
    }
}

#[async_trait]
impl SourceFetcher for YtDlpFetcher {
    async fn fetch(
        &self,
        identity: &SourceIdentity,
        destination: &Path,
        job_id: &str,
        relay: &ProgressRelay,
        cancel: watch::Receiver<bool>,
    ) -> AcquireResult<FetchOutcome> {
        which::which("yt-dlp").map_err(|_| ConfigError::ToolNotFound("yt-dlp"))?;

        let locator = url::Url::parse(&identity.locator)
            .map_err(|e| AcquisitionError::InvalidLocator(format!("{}: {e}", identity.locator)))?;
        if !matches!(locator.scheme(), "http" | "https") {
            return Err(AcquisitionError::InvalidLocator(format!(
                "unsupported scheme: {}",
                identity.locator
            )));
        }

        let args = self.build_args(locator.as_str(), destination);
        debug!("Running yt-dlp {}", args.join(" "));

        let mut child = Command::new("yt-dlp")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stderr = child.stderr.take().ok_or_else(|| {
            AcquisitionError::malformed_result("stderr not captured")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            AcquisitionError::malformed_result("stdout not captured")
        })?;

        let progress_job_id = job_id.to_string();
        let progress_relay = relay.clone();
        let stderr_handle = tokio::spawn(async move {
            let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(event) = parse_progress_line(&progress_job_id, &line) {
                    progress_relay.publish(event);
                } else {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
            tail
        });

        let stdout_handle = tokio::spawn(async move {
            let mut last = None;
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim().to_string();
                if !line.is_empty() {
                    last = Some(line);
                }
            }
            last
        });

        let wait_result = self.wait_for_completion(&mut child, cancel).await;

        let stderr_tail = stderr_handle.await.unwrap_or_default();
        let result_line = stdout_handle.await.unwrap_or_default();

        let status = match wait_result {
            Ok(status) => status,
            Err(err) => {
                cleanup_partial(destination).await;
                return Err(err);
            }
        };

        if !status.success() {
            cleanup_partial(destination).await;
            let stderr_text = stderr_tail.iter().cloned().collect::<Vec<_>>().join("\n");
            let kind = classify_fetch_failure(&stderr_text);
            let message = stderr_tail
                .back()
                .cloned()
                .unwrap_or_else(|| "yt-dlp exited with non-zero status".to_string());
            warn!(
                job_id = %job_id,
                kind = %kind,
                exit_code = ?status.code(),
                "Fetch failed"
            );
            return Err(AcquisitionError::fetch_failed(kind, message));
        }

        let path = PathBuf::from(result_line.ok_or_else(|| {
            AcquisitionError::malformed_result("fetch succeeded but reported no output path")
        })?);

        let metadata = tokio::fs::metadata(&path).await.map_err(|_| {
            AcquisitionError::malformed_result(format!(
                "reported output path does not exist: {}",
                path.display()
            ))
        })?;

        info!(
            job_id = %job_id,
            path = %path.display(),
            size_mb = metadata.len() as f64 / (1024.0 * 1024.0),
            "Fetched source"
        );

        Ok(FetchOutcome {
            path,
            size_bytes: metadata.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_progress_line() {
        let line = r#"{"percent":"  42.3%","downloaded_bytes":423000,"total_bytes":1000000,"speed":52428.8,"eta":11}"#;
        let event = parse_progress_line("j1", line).unwrap();
        assert_eq!(event.stage, ProgressStage::Fetching);
        assert!((event.percent - 42.3).abs() < 0.01);
        assert_eq!(event.downloaded_bytes, Some(423000));
        assert_eq!(event.total_bytes, Some(1000000));
        assert_eq!(event.eta_seconds, Some(11));
    }

    #[test]
    fn falls_back_to_byte_ratio_when_percent_is_unparsable() {
        let line = r#"{"percent":"N/A","downloaded_bytes":250000,"total_bytes":1000000,"speed":null,"eta":null}"#;
        let event = parse_progress_line("j1", line).unwrap();
        assert!((event.percent - 25.0).abs() < 0.01);
        assert!(event.speed.is_none());
    }

    #[test]
    fn discards_noise_lines() {
        assert!(parse_progress_line("j1", "WARNING: unable to extract thumbnail").is_none());
        assert!(parse_progress_line("j1", "").is_none());
        assert!(parse_progress_line("j1", "{\"percent\": not json").is_none());
        // Valid JSON of the wrong shape
        assert!(parse_progress_line("j1", "[1,2,3]").is_none());
    }

    #[test]
    fn classifies_common_failures() {
        assert_eq!(
            classify_fetch_failure("ERROR: HTTP Error 429: Too Many Requests"),
            FetchFailureKind::RateLimited
        );
        assert_eq!(
            classify_fetch_failure("ERROR: Video unavailable"),
            FetchFailureKind::Unavailable
        );
        assert_eq!(
            classify_fetch_failure("ERROR: Private video. Sign in if you've been granted access"),
            FetchFailureKind::Restricted
        );
        assert_eq!(
            classify_fetch_failure("ERROR: Unable to connect: connection refused"),
            FetchFailureKind::Network
        );
        assert_eq!(
            classify_fetch_failure("something entirely different"),
            FetchFailureKind::Unknown
        );
    }

    #[tokio::test]
    async fn cleanup_sweeps_all_files_sharing_the_template_stem() {
        let dir = tempfile::TempDir::new().unwrap();
        let template = dir.path().join("source-abc.%(ext)s");

        for name in [
            "source-abc.mp4",
            "source-abc.mp4.part",
            "source-abc.f137.mp4.part",
        ] {
            std::fs::write(dir.path().join(name), b"partial").unwrap();
        }
        std::fs::write(dir.path().join("other.mp4"), b"keep").unwrap();

        cleanup_partial(&template).await;

        assert!(!dir.path().join("source-abc.mp4").exists());
        assert!(!dir.path().join("source-abc.mp4.part").exists());
        assert!(!dir.path().join("source-abc.f137.mp4.part").exists());
        assert!(dir.path().join("other.mp4").exists());
    }

    #[tokio::test]
    async fn cleanup_handles_plain_destinations() {
        let dir = tempfile::TempDir::new().unwrap();
        let destination = dir.path().join("out.mp4");
        std::fs::write(&destination, b"partial").unwrap();
        std::fs::write(dir.path().join("out.mp4.part"), b"partial").unwrap();

        cleanup_partial(&destination).await;

        assert!(!destination.exists());
        assert!(!dir.path().join("out.mp4.part").exists());
    }

    #[test]
    fn build_args_carry_template_and_result_print() {
        let fetcher = YtDlpFetcher::new();
        let args = fetcher.build_args("https://example.com/v", Path::new("/tmp/out.mp4"));
        assert!(args.contains(&"--progress-template".to_string()));
        assert!(args.contains(&"after_move:filepath".to_string()));
        assert!(args.contains(&"--no-playlist".to_string()));
        assert_eq!(args.last().unwrap(), "https://example.com/v");
    }
}
