//! Seams to the external encoding engine and the media inspector.
//!
//! An [`Engine`] is a stateful instance with its own private file namespace.
//! Exactly one exists at a time; [`lifecycle::EngineLifecycleManager`] owns it.

pub mod lifecycle;

use std::path::Path;
use std::sync::Arc;

use image::RgbImage;

use crate::error::AppError;
use crate::ffmpeg::{FrameWidth, ProgressCallback};

pub use lifecycle::{EngineLease, EngineLifecycleManager, EngineState};

/// Blocking operations on one engine instance. Called from the blocking pool.
pub trait Engine: Send + Sync {
    fn write_file(&self, name: &str, data: &[u8]) -> Result<(), AppError>;

    fn read_file(&self, name: &str) -> Result<Vec<u8>, AppError>;

    fn delete_file(&self, name: &str) -> Result<(), AppError>;

    /// Runs one engine command to completion, reporting 0-1 progress.
    fn exec(
        &self,
        args: &[String],
        duration_secs: Option<f64>,
        progress: Option<ProgressCallback>,
    ) -> Result<(), AppError>;

    /// Stops the in-flight command, if any. The blocked `exec` returns `Aborted`.
    fn abort(&self);

    /// Releases everything the instance holds. The instance is unusable afterwards.
    fn terminate(&self);
}

/// Creates engine instances. Injected so tests can count loads and script failures.
pub trait EngineLoader: Send + Sync {
    fn load(&self) -> Result<Arc<dyn Engine>, AppError>;
}

/// Reads source media outside the engine: duration and single decoded frames.
pub trait MediaInspector: Send + Sync {
    fn duration_secs(&self, path: &Path) -> Result<f64, AppError>;

    fn decode_frame(
        &self,
        path: &Path,
        timestamp_secs: f64,
        width: FrameWidth,
    ) -> Result<RgbImage, AppError>;
}
