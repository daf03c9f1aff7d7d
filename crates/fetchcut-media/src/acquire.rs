//! Source acquisition and the per-run source cache.
//!
//! Acquisition is download-once-cut-many: the first job to ask for a
//! source fetches it, later jobs for the same identity share the cached
//! file, and the file is deleted once the last holder releases it. Local
//! sources are verified readable and never copied or deleted.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use fetchcut_models::SourceIdentity;

use crate::error::{AcquireResult, AcquisitionError};
use crate::fetch::SourceFetcher;
use crate::relay::ProgressRelay;

/// A source file available on local disk, held by one or more jobs.
#[derive(Debug)]
pub struct CachedSource {
    pub identity: SourceIdentity,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Cache slot this source belongs to
    key: String,
    /// Whether the cache fetched this file and owns its deletion
    owned: bool,
}

impl CachedSource {
    pub fn cache_key(&self) -> &str {
        &self.key
    }
}

enum SlotState {
    /// A fetch is in flight; the receiver resolves when it settles
    Fetching(watch::Receiver<bool>),
    Ready {
        source: Arc<CachedSource>,
        refs: usize,
    },
}

/// Reference-counted cache of acquired sources, keyed by identity.
pub struct SourceCache {
    fetcher: Arc<dyn SourceFetcher>,
    work_dir: PathBuf,
    relay: ProgressRelay,
    slots: Mutex<HashMap<String, SlotState>>,
}

impl SourceCache {
    pub fn new(
        fetcher: Arc<dyn SourceFetcher>,
        work_dir: impl Into<PathBuf>,
        relay: ProgressRelay,
    ) -> Self {
        Self {
            fetcher,
            work_dir: work_dir.into(),
            relay,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire a source, fetching it if no job holds it yet.
    ///
    /// Concurrent acquires for the same identity coalesce onto a single
    /// fetch; acquires for distinct identities proceed independently.
    pub async fn acquire(
        &self,
        identity: &SourceIdentity,
        job_id: &str,
        cancel: watch::Receiver<bool>,
    ) -> AcquireResult<Arc<CachedSource>> {
        let key = identity.cache_key();

        let settled_tx = loop {
            let mut waiter = {
                let mut slots = self.slots.lock().await;
                match slots.get_mut(&key) {
                    Some(SlotState::Ready { source, refs }) => {
                        *refs += 1;
                        debug!(job_id = %job_id, key = %key, refs = *refs, "Source cache hit");
                        return Ok(source.clone());
                    }
                    Some(SlotState::Fetching(rx)) => rx.clone(),
                    None => {
                        let (tx, rx) = watch::channel(false);
                        slots.insert(key.clone(), SlotState::Fetching(rx));
                        break tx;
                    }
                }
            };
            // Another job is fetching this source; wait for it to settle
            // and re-check. An errored recv means the fetch was abandoned.
            let _ = waiter.changed().await;
        };

        let result = self.materialize(identity, job_id, cancel).await;

        let mut slots = self.slots.lock().await;
        match result {
            Ok(source) => {
                let source = Arc::new(source);
                slots.insert(
                    key,
                    SlotState::Ready {
                        source: source.clone(),
                        refs: 1,
                    },
                );
                let _ = settled_tx.send(true);
                Ok(source)
            }
            Err(err) => {
                // Clear the slot so a later job can retry the fetch
                slots.remove(&key);
                drop(settled_tx);
                Err(err)
            }
        }
    }

    /// Release a held source. The backing file of a fetched source is
    /// deleted when the last holder releases it.
    pub async fn release(&self, source: &Arc<CachedSource>) {
        let mut slots = self.slots.lock().await;

        let remaining = match slots.get_mut(source.cache_key()) {
            Some(SlotState::Ready { refs, .. }) => {
                *refs = refs.saturating_sub(1);
                *refs
            }
            _ => {
                warn!(key = %source.cache_key(), "Release for a source not in the cache");
                return;
            }
        };

        if remaining == 0 {
            slots.remove(source.cache_key());
            if source.owned {
                match tokio::fs::remove_file(&source.path).await {
                    Ok(()) => {
                        info!(path = %source.path.display(), "Removed cached source")
                    }
                    Err(e) => {
                        warn!(path = %source.path.display(), error = %e, "Failed to remove cached source")
                    }
                }
            }
        } else {
            debug!(key = %source.cache_key(), refs = remaining, "Source still held");
        }
    }

    /// Number of sources currently held.
    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.lock().await.is_empty()
    }

    async fn materialize(
        &self,
        identity: &SourceIdentity,
        job_id: &str,
        cancel: watch::Receiver<bool>,
    ) -> AcquireResult<CachedSource> {
        let key = identity.cache_key();

        if identity.is_local() {
            let path = PathBuf::from(&identity.locator);
            let metadata = tokio::fs::metadata(&path)
                .await
                .map_err(|_| AcquisitionError::SourceNotReadable(path.clone()))?;
            if !metadata.is_file() {
                return Err(AcquisitionError::SourceNotReadable(path));
            }
            debug!(job_id = %job_id, path = %path.display(), "Using local source in place");
            return Ok(CachedSource {
                identity: identity.clone(),
                path,
                size_bytes: metadata.len(),
                key,
                owned: false,
            });
        }

        tokio::fs::create_dir_all(&self.work_dir).await?;
        // yt-dlp substitutes the container extension it actually produced
        let template = self
            .work_dir
            .join(format!("source-{}.%(ext)s", Uuid::new_v4().simple()));

        info!(job_id = %job_id, source = %identity, "Fetching source");
        let outcome = self
            .fetcher
            .fetch(identity, &template, job_id, &self.relay, cancel)
            .await?;

        Ok(CachedSource {
            identity: identity.clone(),
            path: outcome.path,
            size_bytes: outcome.size_bytes,
            key,
            owned: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::never_cancelled;
    use crate::error::FetchFailureKind;
    use crate::fetch::FetchOutcome;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingFetcher {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingFetcher {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: true,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SourceFetcher for CountingFetcher {
        async fn fetch(
            &self,
            _identity: &SourceIdentity,
            destination: &Path,
            _job_id: &str,
            _relay: &ProgressRelay,
            _cancel: watch::Receiver<bool>,
        ) -> AcquireResult<FetchOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AcquisitionError::fetch_failed(
                    FetchFailureKind::Network,
                    "no route to host",
                ));
            }
            let path = destination.with_extension("mp4");
            tokio::fs::write(&path, b"video bytes").await?;
            Ok(FetchOutcome {
                path,
                size_bytes: 11,
            })
        }
    }

    fn cache(fetcher: Arc<dyn SourceFetcher>, dir: &TempDir) -> SourceCache {
        SourceCache::new(fetcher, dir.path(), ProgressRelay::new())
    }

    #[tokio::test]
    async fn repeated_acquires_fetch_once() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(CountingFetcher::new());
        let cache = cache(fetcher.clone(), &dir);
        let identity = SourceIdentity::remote("https://example.com/v").with_content_id("vid1");

        let a = cache
            .acquire(&identity, "job-a", never_cancelled())
            .await
            .unwrap();
        let b = cache
            .acquire(&identity, "job-b", never_cancelled())
            .await
            .unwrap();

        assert_eq!(fetcher.calls(), 1);
        assert_eq!(a.path, b.path);
    }

    #[tokio::test]
    async fn owned_file_deleted_only_at_last_release() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(CountingFetcher::new());
        let cache = cache(fetcher, &dir);
        let identity = SourceIdentity::remote("https://example.com/v");

        let a = cache
            .acquire(&identity, "job-a", never_cancelled())
            .await
            .unwrap();
        let b = cache
            .acquire(&identity, "job-b", never_cancelled())
            .await
            .unwrap();
        let path = a.path.clone();

        cache.release(&a).await;
        assert!(path.exists(), "file must survive while still held");

        cache.release(&b).await;
        assert!(!path.exists(), "file must be deleted at refcount zero");
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn local_source_is_used_in_place_and_never_deleted() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("already-here.mp4");
        tokio::fs::write(&local, b"local bytes").await.unwrap();

        let fetcher = Arc::new(CountingFetcher::new());
        let cache = cache(fetcher.clone(), &dir);
        let identity = SourceIdentity::local(local.to_string_lossy().to_string());

        let held = cache
            .acquire(&identity, "job-a", never_cancelled())
            .await
            .unwrap();
        assert_eq!(held.path, local);
        assert_eq!(fetcher.calls(), 0);

        cache.release(&held).await;
        assert!(local.exists(), "local sources are not owned by the cache");
    }

    #[tokio::test]
    async fn missing_local_source_is_rejected() {
        let dir = TempDir::new().unwrap();
        let cache = cache(Arc::new(CountingFetcher::new()), &dir);
        let identity = SourceIdentity::local("/nonexistent/file.mp4");

        let err = cache
            .acquire(&identity, "job-a", never_cancelled())
            .await
            .unwrap_err();
        assert!(matches!(err, AcquisitionError::SourceNotReadable(_)));
    }

    #[tokio::test]
    async fn failed_fetch_clears_slot_for_retry() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(CountingFetcher::failing());
        let cache = cache(fetcher.clone(), &dir);
        let identity = SourceIdentity::remote("https://example.com/v");

        assert!(cache
            .acquire(&identity, "job-a", never_cancelled())
            .await
            .is_err());
        assert!(cache.is_empty().await);

        // A later attempt fetches again rather than reusing the failure
        assert!(cache
            .acquire(&identity, "job-b", never_cancelled())
            .await
            .is_err());
        assert_eq!(fetcher.calls(), 2);
    }
}
