//! Persists relayed progress into the job store.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use fetchcut_media::ProgressRelay;
use fetchcut_models::{JobId, JobState};
use fetchcut_queue::JobStore;

/// Subscribe to the relay and mirror each event's percentage onto its
/// job. Missed events are harmless: the next one carries the latest
/// percentage anyway.
pub fn spawn_progress_sink(
    relay: &ProgressRelay,
    store: Arc<dyn JobStore>,
) -> JoinHandle<()> {
    let mut events = relay.subscribe();

    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Progress sink lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let id = JobId::from_string(event.job_id.clone());
            match store.get(&id).await {
                Ok(Some(job)) if job.state == JobState::Running => {
                    let updated = job.with_progress(event.percent.round() as u8);
                    if let Err(e) = store.update(updated).await {
                        warn!(job_id = %id, error = %e, "Failed to persist progress");
                    }
                }
                // Late events for settled or unknown jobs are dropped
                Ok(_) => {}
                Err(e) => warn!(job_id = %id, error = %e, "Progress lookup failed"),
            }
        }
    })
}
