//! Shared data models for the fetchcut pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Time-bounded segments and their validation rules
//! - Source identities (remote locators and local files)
//! - Acquisition jobs and their lifecycle
//! - Queue statistics and produced-artifact metadata

pub mod identity;
pub mod job;
pub mod segment;

// Re-export common types
pub use identity::{SourceIdentity, SourceKind};
pub use job::{AcquisitionJob, ArtifactInfo, JobId, JobState, QueueStats};
pub use segment::{Segment, SegmentError, SegmentList, SegmentSpec};
