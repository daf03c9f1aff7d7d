//! Acquisition worker: wires the media pipeline to the queue scheduler.

pub mod config;
pub mod error;
pub mod interactive;
pub mod pipeline;
pub mod progress;

pub use config::WorkerConfig;
pub use error::{WorkerError, WorkerResult};
pub use interactive::InteractiveSession;
pub use pipeline::Pipeline;
pub use progress::spawn_progress_sink;
