pub mod batch;
pub mod budget;
pub mod config;
pub mod engine;
pub mod error;
pub mod ffmpeg;
pub mod pipeline;
pub mod scheduler;
#[cfg(any(test, feature = "integration-test-api"))]
pub mod test_support;
pub mod thumbnail;

pub use batch::{BatchProcessor, BatchSummary, Job, JobEvent, JobId, JobStatus};
pub use config::{OptimizationConfig, Settings};
pub use error::{AppError, ErrorKind};
pub use pipeline::{JobOutput, JobPipeline};
