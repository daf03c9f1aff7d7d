//! Progress relay.
//!
//! Normalized progress events fan out over a broadcast channel. Publishing
//! never blocks and never fails the pipeline: events for which no receiver
//! exists (or which a slow receiver misses) are simply dropped.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default buffered events per subscriber before the oldest are dropped.
const DEFAULT_CAPACITY: usize = 256;

/// Which phase of the pipeline a progress event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Fetching,
    Cutting,
    Concatenating,
}

impl std::fmt::Display for ProgressStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgressStage::Fetching => write!(f, "fetching"),
            ProgressStage::Cutting => write!(f, "cutting"),
            ProgressStage::Concatenating => write!(f, "concatenating"),
        }
    }
}

/// A normalized progress event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// The job this event belongs to
    pub job_id: String,
    pub stage: ProgressStage,
    /// Completion percentage (0.0-100.0)
    pub percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downloaded_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    /// Transfer or encode speed in bytes per second
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
}

impl ProgressEvent {
    pub fn new(job_id: impl Into<String>, stage: ProgressStage, percent: f64) -> Self {
        Self {
            job_id: job_id.into(),
            stage,
            percent: percent.clamp(0.0, 100.0),
            downloaded_bytes: None,
            total_bytes: None,
            speed: None,
            eta_seconds: None,
        }
    }
}

/// Fan-out point for progress events.
///
/// Cheap to clone; all clones publish into the same channel.
#[derive(Debug, Clone)]
pub struct ProgressRelay {
    tx: broadcast::Sender<ProgressEvent>,
}

impl ProgressRelay {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Best-effort: a send with no live receivers is
    /// not an error.
    pub fn publish(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ProgressRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_receivers_is_silent() {
        let relay = ProgressRelay::new();
        relay.publish(ProgressEvent::new("job-1", ProgressStage::Fetching, 50.0));
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let relay = ProgressRelay::new();
        let mut rx_a = relay.subscribe();
        let mut rx_b = relay.subscribe();

        relay.publish(ProgressEvent::new("job-1", ProgressStage::Cutting, 25.0));

        let a = rx_a.recv().await.unwrap();
        let b = rx_b.recv().await.unwrap();
        assert_eq!(a.job_id, "job-1");
        assert_eq!(b.stage, ProgressStage::Cutting);
        assert!((a.percent - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn percent_is_clamped() {
        let event = ProgressEvent::new("j", ProgressStage::Fetching, 150.0);
        assert!((event.percent - 100.0).abs() < f64::EPSILON);

        let event = ProgressEvent::new("j", ProgressStage::Fetching, -3.0);
        assert!(event.percent.abs() < f64::EPSILON);
    }
}
