//! The acquisition pipeline: what actually happens when a job is claimed.
//!
//! Sandbox check, source acquisition through the shared cache, then
//! composition. The cached source is released on every exit path so the
//! cache's refcounts stay balanced even when composition fails.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

use fetchcut_media::{
    AcquisitionError, Composer, CompositionError, FfmpegTranscoder, OutputSandbox,
    ProgressRelay, SourceCache, YtDlpFetcher,
};
use fetchcut_models::{AcquisitionJob, ArtifactInfo};
use fetchcut_queue::{JobRunError, JobRunner};

use crate::config::WorkerConfig;
use crate::error::WorkerResult;

/// Runs claimed jobs end to end.
pub struct Pipeline {
    cache: Arc<SourceCache>,
    sandbox: OutputSandbox,
    relay: ProgressRelay,
    work_dir: PathBuf,
    transcode_timeout_secs: u64,
}

impl Pipeline {
    /// Wire up a pipeline from worker config. Verifies the external tools
    /// are present before accepting any work.
    pub fn new(config: &WorkerConfig, relay: ProgressRelay) -> WorkerResult<Self> {
        fetchcut_media::check_ffmpeg()?;
        fetchcut_media::check_ytdlp()?;

        let fetcher = Arc::new(
            YtDlpFetcher::new().with_timeout(config.fetch_timeout.as_secs()),
        );
        let cache = Arc::new(SourceCache::new(
            fetcher,
            config.work_dir.join("sources"),
            relay.clone(),
        ));
        let sandbox = OutputSandbox::new(&config.output_dir)?;

        Ok(Self {
            cache,
            sandbox,
            relay,
            work_dir: config.work_dir.clone(),
            transcode_timeout_secs: config.transcode_timeout.as_secs(),
        })
    }

    /// Pipeline over an externally built cache and sandbox. For tests and
    /// interactive sessions that bring their own fetcher.
    pub fn with_parts(
        cache: Arc<SourceCache>,
        sandbox: OutputSandbox,
        relay: ProgressRelay,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cache,
            sandbox,
            relay,
            work_dir: work_dir.into(),
            transcode_timeout_secs: 1800,
        }
    }

    async fn run_inner(
        &self,
        job: &AcquisitionJob,
        cancel: watch::Receiver<bool>,
    ) -> Result<ArtifactInfo, JobRunError> {
        let destination = self
            .sandbox
            .resolve(&job.destination)
            .map_err(|e| JobRunError::failed(e.to_string()))?;

        let source = self
            .cache
            .acquire(&job.identity, job.id.as_str(), cancel.clone())
            .await
            .map_err(map_acquisition)?;

        debug!(
            job_id = %job.id,
            source = %source.path.display(),
            destination = %destination.display(),
            "Composing"
        );

        let transcoder = Arc::new(
            FfmpegTranscoder::new()
                .with_timeout(self.transcode_timeout_secs)
                .with_relay(self.relay.clone(), job.id.as_str()),
        );
        let composer = Composer::new(transcoder, self.work_dir.join("compose"));

        let result = composer
            .compose(&source.path, &job.segments, &destination, cancel)
            .await;

        // Balance the acquire before surfacing any error
        self.cache.release(&source).await;

        result.map_err(map_composition)
    }
}

fn map_acquisition(err: AcquisitionError) -> JobRunError {
    if err.is_cancelled() {
        JobRunError::Cancelled
    } else {
        JobRunError::failed(err.to_string())
    }
}

fn map_composition(err: CompositionError) -> JobRunError {
    if err.is_cancelled() {
        JobRunError::Cancelled
    } else {
        JobRunError::failed(err.to_string())
    }
}

#[async_trait]
impl JobRunner for Pipeline {
    async fn run(
        &self,
        job: AcquisitionJob,
        cancel: watch::Receiver<bool>,
    ) -> Result<ArtifactInfo, JobRunError> {
        self.run_inner(&job, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fetchcut_media::fetch::{FetchOutcome, SourceFetcher};
    use fetchcut_media::never_cancelled;
    use fetchcut_media::AcquireResult;
    use fetchcut_models::{SegmentList, SegmentSpec, SourceIdentity};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct StubFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SourceFetcher for StubFetcher {
        async fn fetch(
            &self,
            _identity: &SourceIdentity,
            destination: &Path,
            _job_id: &str,
            _relay: &ProgressRelay,
            _cancel: watch::Receiver<bool>,
        ) -> AcquireResult<FetchOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let path = destination.with_extension("mp4");
            tokio::fs::write(&path, b"fetched source").await?;
            Ok(FetchOutcome {
                path,
                size_bytes: 14,
            })
        }
    }

    fn pipeline(root: &TempDir) -> (Pipeline, Arc<SourceCache>) {
        let relay = ProgressRelay::new();
        let cache = Arc::new(SourceCache::new(
            Arc::new(StubFetcher {
                calls: AtomicUsize::new(0),
            }),
            root.path().join("work/sources"),
            relay.clone(),
        ));
        let sandbox = OutputSandbox::new(root.path().join("output")).unwrap();
        let pipeline = Pipeline::with_parts(
            cache.clone(),
            sandbox,
            relay,
            root.path().join("work"),
        );
        (pipeline, cache)
    }

    #[tokio::test]
    async fn whole_source_job_copies_fetched_file_and_releases_cache() {
        let root = TempDir::new().unwrap();
        let (pipeline, cache) = pipeline(&root);

        let job = AcquisitionJob::new(
            SourceIdentity::remote("https://example.com/v"),
            SegmentList::empty(),
            "clip.mp4",
        );

        let artifact = pipeline.run(job, never_cancelled()).await.unwrap();
        assert!(artifact.path.starts_with(root.path().join("output")));
        assert_eq!(
            std::fs::read(&artifact.path).unwrap(),
            b"fetched source"
        );
        assert!(cache.is_empty().await, "pipeline must release its source");
    }

    #[tokio::test]
    async fn destination_outside_sandbox_fails_before_any_fetch() {
        let root = TempDir::new().unwrap();
        let (pipeline, cache) = pipeline(&root);

        let job = AcquisitionJob::new(
            SourceIdentity::remote("https://example.com/v"),
            SegmentList::validate(&[SegmentSpec::new(Some(0), Some(5))]).unwrap(),
            "../escape.mp4",
        );

        let err = pipeline.run(job, never_cancelled()).await.unwrap_err();
        assert!(matches!(err, JobRunError::Failed(_)));
        assert!(cache.is_empty().await, "nothing should have been acquired");
    }
}
