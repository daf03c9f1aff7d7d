//! FFmpeg command builder and runner.
//!
//! Cuts and concatenations are stream copies: no re-encode, so both
//! operations are I/O bound and keyframe-aligned. The runner mirrors the
//! fetcher's process handling: cancellation via a watch channel, a grace
//! period before a hard kill, and an optional overall timeout.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{ComposeResult, CompositionError, ConfigError};
use crate::relay::{ProgressEvent, ProgressRelay, ProgressStage};

const DEFAULT_KILL_GRACE_SECS: u64 = 5;

/// Builder for FFmpeg invocations.
#[derive(Debug, Clone)]
pub struct TranscodeCommand {
    input: PathBuf,
    output: PathBuf,
    /// Arguments placed before -i
    input_args: Vec<String>,
    /// Arguments placed after -i
    output_args: Vec<String>,
    stage: &'static str,
}

impl TranscodeCommand {
    /// Stream-copy cut of a single segment.
    ///
    /// The seek goes before the input for fast keyframe seeking; the copy
    /// codec and `-avoid_negative_ts make_zero` keep container timestamps
    /// sane after the cut.
    pub fn cut(
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
        start_secs: Option<u64>,
        duration_secs: Option<u64>,
    ) -> Self {
        let mut cmd = Self {
            input: input.as_ref().to_path_buf(),
            output: output.as_ref().to_path_buf(),
            input_args: Vec::new(),
            output_args: Vec::new(),
            stage: "cut",
        };

        if let Some(start) = start_secs {
            cmd.input_args.push("-ss".to_string());
            cmd.input_args.push(start.to_string());
        }

        cmd.output_args.push("-c".to_string());
        cmd.output_args.push("copy".to_string());
        if let Some(duration) = duration_secs {
            cmd.output_args.push("-t".to_string());
            cmd.output_args.push(duration.to_string());
        }
        cmd.output_args.push("-avoid_negative_ts".to_string());
        cmd.output_args.push("make_zero".to_string());

        cmd
    }

    /// Stream-copy concatenation driven by a concat demuxer manifest.
    pub fn concat(manifest: impl AsRef<Path>, output: impl AsRef<Path>) -> Self {
        Self {
            input: manifest.as_ref().to_path_buf(),
            output: output.as_ref().to_path_buf(),
            input_args: vec![
                "-f".to_string(),
                "concat".to_string(),
                "-safe".to_string(),
                "0".to_string(),
            ],
            output_args: vec!["-c".to_string(), "copy".to_string()],
            stage: "concat",
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Build the full argument list.
    pub fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "-y".to_string(),
            "-v".to_string(),
            "error".to_string(),
            "-progress".to_string(),
            "pipe:2".to_string(),
        ];
        args.extend(self.input_args.clone());
        args.push("-i".to_string());
        args.push(self.input.to_string_lossy().to_string());
        args.extend(self.output_args.clone());
        args.push(self.output.to_string_lossy().to_string());
        args
    }
}

/// A parsed `-progress pipe:2` snapshot.
#[derive(Debug, Clone, Default)]
pub struct TranscodeProgress {
    pub out_time_ms: i64,
    pub speed: f64,
    pub is_complete: bool,
}

impl TranscodeProgress {
    /// Completion percentage given the expected output duration.
    pub fn percentage(&self, total_duration_ms: i64) -> f64 {
        if total_duration_ms <= 0 {
            return 0.0;
        }
        ((self.out_time_ms as f64 / total_duration_ms as f64) * 100.0).min(100.0)
    }
}

/// Parse a line of FFmpeg's key=value progress stream. Returns a snapshot
/// whenever a `progress=` terminator arrives.
fn parse_transcode_line(line: &str, current: &mut TranscodeProgress) -> Option<TranscodeProgress> {
    let line = line.trim();

    if let Some((key, value)) = line.split_once('=') {
        match key {
            "out_time_ms" | "out_time_us" => {
                // Both keys are microseconds in practice
                if let Ok(us) = value.parse::<i64>() {
                    current.out_time_ms = us / 1000;
                }
            }
            "speed" => {
                if let Some(speed_str) = value.strip_suffix('x') {
                    if let Ok(speed) = speed_str.trim().parse() {
                        current.speed = speed;
                    }
                }
            }
            "progress" => {
                if value == "end" {
                    current.is_complete = true;
                }
                return Some(current.clone());
            }
            _ => {}
        }
    }

    None
}

/// Executes cut and concat operations.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn cut(
        &self,
        input: &Path,
        output: &Path,
        start_secs: Option<u64>,
        duration_secs: Option<u64>,
        cancel: watch::Receiver<bool>,
    ) -> ComposeResult<()>;

    async fn concat(
        &self,
        manifest: &Path,
        output: &Path,
        cancel: watch::Receiver<bool>,
    ) -> ComposeResult<()>;
}

/// FFmpeg-backed [`Transcoder`].
pub struct FfmpegTranscoder {
    timeout_secs: Option<u64>,
    kill_grace_secs: u64,
    /// Set to republish transcode progress for a job
    relay: Option<(ProgressRelay, String)>,
}

impl FfmpegTranscoder {
    pub fn new() -> Self {
        Self {
            timeout_secs: None,
            kill_grace_secs: DEFAULT_KILL_GRACE_SECS,
            relay: None,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_kill_grace(mut self, secs: u64) -> Self {
        self.kill_grace_secs = secs;
        self
    }

    /// Publish progress events for `job_id` on `relay`.
    pub fn with_relay(mut self, relay: ProgressRelay, job_id: impl Into<String>) -> Self {
        self.relay = Some((relay, job_id.into()));
        self
    }

    async fn run(
        &self,
        cmd: &TranscodeCommand,
        expected_duration_ms: Option<i64>,
        cancel: watch::Receiver<bool>,
    ) -> ComposeResult<()> {
        which::which("ffmpeg").map_err(|_| ConfigError::ToolNotFound("ffmpeg"))?;

        let args = cmd.build_args();
        debug!("Running ffmpeg {}", args.join(" "));

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let stage = cmd.stage();
        let progress_stage = if stage == "concat" {
            ProgressStage::Concatenating
        } else {
            ProgressStage::Cutting
        };

        let stderr = child.stderr.take().ok_or_else(|| {
            CompositionError::transcode_failed(stage, "stderr not captured", None, None)
        })?;
        let relay = self.relay.clone();
        let stderr_handle = tokio::spawn(async move {
            let mut tail: Vec<String> = Vec::new();
            let mut current = TranscodeProgress::default();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(snapshot) = parse_transcode_line(&line, &mut current) {
                    if let (Some((relay, job_id)), Some(total)) =
                        (relay.as_ref(), expected_duration_ms)
                    {
                        let mut event = ProgressEvent::new(
                            job_id.clone(),
                            progress_stage,
                            snapshot.percentage(total),
                        );
                        event.speed = (snapshot.speed > 0.0).then_some(snapshot.speed);
                        relay.publish(event);
                    }
                } else if !line.trim().is_empty() && !line.contains('=') {
                    if tail.len() < 50 {
                        tail.push(line);
                    }
                }
            }
            tail
        });

        let wait_result = self.wait_for_completion(&mut child, cancel, stage).await;
        let stderr_tail = stderr_handle.await.unwrap_or_default();

        let status = wait_result?;
        if status.success() {
            Ok(())
        } else {
            Err(CompositionError::transcode_failed(
                stage,
                "ffmpeg exited with non-zero status",
                (!stderr_tail.is_empty()).then(|| stderr_tail.join("\n")),
                status.code(),
            ))
        }
    }

    async fn wait_for_completion(
        &self,
        child: &mut Child,
        mut cancel: watch::Receiver<bool>,
        stage: &'static str,
    ) -> ComposeResult<std::process::ExitStatus> {
        enum WaitEvent {
            Exited(std::io::Result<std::process::ExitStatus>),
            Cancelled,
            TimedOut,
        }

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
                info!(stage = stage, "Transcode cancelled, stopping ffmpeg");
                crate::cancel::request_stop(child);
                let grace = Duration::from_secs(self.kill_grace_secs);
                if tokio::time::timeout(grace, child.wait()).await.is_err() {
                    warn!("ffmpeg did not exit within grace period, killing");
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                }
                Err(CompositionError::Cancelled)
            }
            WaitEvent::TimedOut => {
                let secs = self.timeout_secs.unwrap_or(0);
                warn!(stage = stage, "ffmpeg timed out after {} seconds, killing", secs);
                let _ = child.kill().await;
                let _ = child.wait().await;
                Err(CompositionError::Timeout(secs))
            }
        }
    }
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Check if ffmpeg is available.
pub fn check_ffmpeg() -> Result<PathBuf, ConfigError> {
    which::which("ffmpeg").map_err(|_| ConfigError::ToolNotFound("ffmpeg"))
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn cut(
        &self,
        input: &Path,
        output: &Path,
        start_secs: Option<u64>,
        duration_secs: Option<u64>,
        cancel: watch::Receiver<bool>,
    ) -> ComposeResult<()> {
        let cmd = TranscodeCommand::cut(input, output, start_secs, duration_secs);
        let expected_ms = duration_secs.map(|s| s as i64 * 1000);
        self.run(&cmd, expected_ms, cancel).await
    }

    async fn concat(
        &self,
        manifest: &Path,
        output: &Path,
        cancel: watch::Receiver<bool>,
    ) -> ComposeResult<()> {
        let cmd = TranscodeCommand::concat(manifest, output);
        self.run(&cmd, None, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cut_args_use_stream_copy_and_fast_seek() {
        let cmd = TranscodeCommand::cut("in.mp4", "out.mp4", Some(10), Some(30));
        let args = cmd.build_args();

        let ss = args.iter().position(|a| a == "-ss").unwrap();
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert!(ss < input, "seek must come before the input");
        assert_eq!(args[ss + 1], "10");

        assert!(args.windows(2).any(|w| w[0] == "-c" && w[1] == "copy"));
        assert!(args.windows(2).any(|w| w[0] == "-t" && w[1] == "30"));
        assert!(args
            .windows(2)
            .any(|w| w[0] == "-avoid_negative_ts" && w[1] == "make_zero"));
    }

    #[test]
    fn open_bounds_omit_seek_and_duration() {
        let cmd = TranscodeCommand::cut("in.mp4", "out.mp4", None, None);
        let args = cmd.build_args();
        assert!(!args.contains(&"-ss".to_string()));
        assert!(!args.contains(&"-t".to_string()));
    }

    #[test]
    fn concat_args_use_demuxer_with_unsafe_paths() {
        let cmd = TranscodeCommand::concat("parts.txt", "out.mp4");
        let args = cmd.build_args();

        let f = args.iter().position(|a| a == "-f").unwrap();
        assert_eq!(args[f + 1], "concat");
        assert!(args.windows(2).any(|w| w[0] == "-safe" && w[1] == "0"));
        assert!(args.windows(2).any(|w| w[0] == "-c" && w[1] == "copy"));
        assert_eq!(cmd.stage(), "concat");
    }

    #[test]
    fn progress_snapshot_on_terminator() {
        let mut current = TranscodeProgress::default();

        assert!(parse_transcode_line("out_time_us=5000000", &mut current).is_none());
        assert!(parse_transcode_line("speed=1.5x", &mut current).is_none());

        let snapshot = parse_transcode_line("progress=continue", &mut current).unwrap();
        assert_eq!(snapshot.out_time_ms, 5000);
        assert!((snapshot.speed - 1.5).abs() < 0.01);
        assert!(!snapshot.is_complete);

        let done = parse_transcode_line("progress=end", &mut current).unwrap();
        assert!(done.is_complete);
    }

    #[test]
    fn progress_percentage_is_capped() {
        let progress = TranscodeProgress {
            out_time_ms: 5000,
            ..Default::default()
        };
        assert!((progress.percentage(10000) - 50.0).abs() < 0.01);
        assert!((progress.percentage(2000) - 100.0).abs() < 0.01);
        assert!(progress.percentage(0).abs() < f64::EPSILON);
    }
}
