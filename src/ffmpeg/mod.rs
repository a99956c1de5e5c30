mod builder;
pub mod discovery;
mod engine;
mod error;
pub mod ffprobe;
mod inspect;
mod progress;
mod runner;

pub use builder::{
    FrameWidth, build_frame_args, build_transcode_args, format_args_for_display_multiline,
};
pub use engine::{FfmpegEngine, FfmpegEngineLoader};
pub use error::{FfmpegErrorPayload, is_memory_fault, parse_ffmpeg_error};
pub use inspect::FfmpegMediaInspector;
pub use progress::progress_percent;
pub use runner::{ProcessSlot, ProgressCallback, run_ffmpeg_blocking, run_ffmpeg_capture};

/// Path to string for FFmpeg args or logging.
pub fn path_to_string(path: &(impl AsRef<std::path::Path> + ?Sized)) -> String {
    path.as_ref().to_string_lossy().to_string()
}
