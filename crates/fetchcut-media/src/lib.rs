//! Media acquisition and composition for the fetchcut pipeline.
//!
//! This crate wraps the external tools (yt-dlp, ffmpeg) behind trait
//! seams and provides:
//! - Source fetching with normalized progress reporting
//! - A reference-counted per-run source cache
//! - Stream-copy segment cutting and concatenation
//! - An output path sandbox
//! - The progress relay used by every pipeline stage

pub mod acquire;
pub mod cancel;
pub mod compose;
pub mod error;
pub mod fetch;
pub mod fs_utils;
pub mod relay;
pub mod sandbox;
pub mod transcode;

pub use acquire::{CachedSource, SourceCache};
pub use cancel::never_cancelled;
pub use compose::Composer;
pub use error::{
    AcquireResult, AcquisitionError, ComposeResult, CompositionError, ConfigError,
    FetchFailureKind,
};
pub use fetch::{check_ytdlp, FetchOutcome, SourceFetcher, YtDlpFetcher};
pub use relay::{ProgressEvent, ProgressRelay, ProgressStage};
pub use sandbox::OutputSandbox;
pub use transcode::{check_ffmpeg, FfmpegTranscoder, TranscodeCommand, Transcoder};
