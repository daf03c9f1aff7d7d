//! Segment composition.
//!
//! Turns a cached source plus a validated segment list into the final
//! artifact. Intermediate cuts live in a scratch directory that is removed
//! on every exit path, and a failed composition never leaves a partial
//! file at the destination.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

use fetchcut_models::{ArtifactInfo, Segment, SegmentList};

use crate::error::{ComposeResult, CompositionError};
use crate::fs_utils;
use crate::transcode::Transcoder;

/// Render the concat demuxer manifest for a list of part files.
///
/// Single quotes in paths are escaped the way the demuxer expects
/// (close quote, escaped quote, reopen).
pub fn concat_manifest(parts: &[PathBuf]) -> String {
    let mut manifest = String::new();
    for part in parts {
        let escaped = part.to_string_lossy().replace('\'', r"'\''");
        manifest.push_str("file '");
        manifest.push_str(&escaped);
        manifest.push_str("'\n");
    }
    manifest
}

/// Composes artifacts from sources and segment lists.
pub struct Composer {
    transcoder: Arc<dyn Transcoder>,
    work_dir: PathBuf,
}

impl Composer {
    pub fn new(transcoder: Arc<dyn Transcoder>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            transcoder,
            work_dir: work_dir.into(),
        }
    }

    /// Compose `destination` from `source` according to `segments`.
    ///
    /// An empty list (or a single whole-source segment) copies the source
    /// unchanged. One bounded segment is a direct cut. Multiple segments
    /// are cut into scratch parts and concatenated in list order.
    pub async fn compose(
        &self,
        source: &Path,
        segments: &SegmentList,
        destination: &Path,
        cancel: watch::Receiver<bool>,
    ) -> ComposeResult<ArtifactInfo> {
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let result = self
            .compose_inner(source, segments, destination, cancel)
            .await;

        if result.is_err() {
            // No partial artifact may survive a failure
            let _ = tokio::fs::remove_file(destination).await;
        }

        result
    }

    async fn compose_inner(
        &self,
        source: &Path,
        segments: &SegmentList,
        destination: &Path,
        cancel: watch::Receiver<bool>,
    ) -> ComposeResult<ArtifactInfo> {
        let whole_source = segments.is_empty()
            || (segments.len() == 1 && segments.as_slice()[0].is_whole_source());

        if whole_source {
            debug!(destination = %destination.display(), "Delivering whole source");
            fs_utils::copy_file(source, destination).await?;
        } else if segments.len() == 1 {
            let segment = segments.as_slice()[0];
            self.cut(source, destination, &segment, cancel).await?;
        } else {
            self.cut_and_concat(source, segments, destination, cancel)
                .await?;
        }

        let metadata = tokio::fs::metadata(destination)
            .await
            .map_err(|_| CompositionError::OutputMissing(destination.to_path_buf()))?;

        info!(
            destination = %destination.display(),
            segments = segments.len(),
            size_bytes = metadata.len(),
            "Composed artifact"
        );

        Ok(ArtifactInfo {
            path: destination.to_path_buf(),
            size_bytes: metadata.len(),
        })
    }

    async fn cut(
        &self,
        source: &Path,
        output: &Path,
        segment: &Segment,
        cancel: watch::Receiver<bool>,
    ) -> ComposeResult<()> {
        self.transcoder
            .cut(
                source,
                output,
                segment.start,
                segment.duration_secs(),
                cancel,
            )
            .await
    }

    async fn cut_and_concat(
        &self,
        source: &Path,
        segments: &SegmentList,
        destination: &Path,
        cancel: watch::Receiver<bool>,
    ) -> ComposeResult<()> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        // Dropped on every exit path, taking parts and manifest with it
        let scratch = tempfile::tempdir_in(&self.work_dir)?;

        let mut parts = Vec::with_capacity(segments.len());
        for (index, segment) in segments.iter().enumerate() {
            let part = scratch.path().join(format!("part_{index:03}.mp4"));
            self.cut(source, &part, segment, cancel.clone()).await?;
            parts.push(part);
        }

        let manifest_path = scratch.path().join("parts.txt");
        tokio::fs::write(&manifest_path, concat_manifest(&parts)).await?;

        self.transcoder
            .concat(&manifest_path, destination, cancel)
            .await
    }
}
