//! Durable job queue and worker scheduler for the fetchcut pipeline.
//!
//! This crate provides:
//! - The [`JobStore`] persistence seam with in-memory and JSON-file
//!   implementations
//! - The [`Scheduler`]: dedup on submit, FIFO claims under a concurrency
//!   ceiling, cancellation, and retry

pub mod error;
pub mod file_store;
pub mod scheduler;
pub mod store;

pub use error::{JobRunError, QueueError, QueueResult};
pub use file_store::JsonFileStore;
pub use scheduler::{JobRunner, Scheduler, SchedulerConfig, Submitted};
pub use store::{JobStore, MemoryJobStore};
