//! Native FFmpeg engine: a private working directory plus one child process at a time.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::engine::{Engine, EngineLoader};
use crate::error::AppError;

use super::discovery::get_ffmpeg_path;
use super::runner::{ProcessSlot, ProgressCallback, run_ffmpeg_blocking};

pub struct FfmpegEngine {
    ffmpeg: PathBuf,
    workdir: PathBuf,
    slot: ProcessSlot,
}

impl FfmpegEngine {
    pub fn new(ffmpeg: PathBuf, workdir: PathBuf) -> Result<Self, AppError> {
        std::fs::create_dir_all(&workdir)?;
        Ok(Self {
            ffmpeg,
            workdir,
            slot: ProcessSlot::new(),
        })
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Names are flat: anything that could escape the working directory is rejected.
    fn resolve(&self, name: &str) -> Result<PathBuf, AppError> {
        let flat = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\'])
            && Path::new(name).is_relative();
        if !flat {
            return Err(AppError::input(format!("Invalid engine file name: {name}")));
        }
        Ok(self.workdir.join(name))
    }
}

impl Engine for FfmpegEngine {
    fn write_file(&self, name: &str, data: &[u8]) -> Result<(), AppError> {
        std::fs::write(self.resolve(name)?, data)?;
        Ok(())
    }

    fn read_file(&self, name: &str) -> Result<Vec<u8>, AppError> {
        Ok(std::fs::read(self.resolve(name)?)?)
    }

    fn delete_file(&self, name: &str) -> Result<(), AppError> {
        match std::fs::remove_file(self.resolve(name)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn exec(
        &self,
        args: &[String],
        duration_secs: Option<f64>,
        progress: Option<ProgressCallback>,
    ) -> Result<(), AppError> {
        run_ffmpeg_blocking(
            &self.ffmpeg,
            args,
            Some(&self.workdir),
            duration_secs,
            progress,
            &self.slot,
        )
    }

    fn abort(&self) {
        self.slot.terminate();
    }

    fn terminate(&self) {
        self.slot.terminate();
        if let Err(e) = std::fs::remove_dir_all(&self.workdir)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            log::warn!(
                target: "budget_vid::ffmpeg::engine",
                "Failed to remove engine dir {}: {}",
                self.workdir.display(),
                e
            );
        }
    }
}

/// Loads [`FfmpegEngine`] instances, each in a fresh directory under `root`.
pub struct FfmpegEngineLoader {
    root: PathBuf,
    loads: AtomicU64,
}

impl FfmpegEngineLoader {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            loads: AtomicU64::new(0),
        }
    }
}

impl Default for FfmpegEngineLoader {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join("budget-vid"))
    }
}

impl EngineLoader for FfmpegEngineLoader {
    fn load(&self) -> Result<Arc<dyn Engine>, AppError> {
        let ffmpeg = get_ffmpeg_path()?;
        let n = self.loads.fetch_add(1, Ordering::Relaxed);
        let workdir = self
            .root
            .join(format!("engine-{}-{}", std::process::id(), n));
        log::info!(
            target: "budget_vid::ffmpeg::engine",
            "Loading FFmpeg engine: ffmpeg={}, dir={}",
            ffmpeg.display(),
            workdir.display()
        );
        let engine = FfmpegEngine::new(ffmpeg.to_path_buf(), workdir)?;
        Ok(Arc::new(engine))
    }
}
