use std::path::Path;

use image::RgbImage;

use crate::engine::MediaInspector;
use crate::error::AppError;

use super::builder::{FrameWidth, build_frame_args};
use super::discovery::get_ffmpeg_path;
use super::ffprobe::get_video_metadata_impl;
use super::path_to_string;
use super::runner::run_ffmpeg_capture;

/// ffprobe for duration, one FFmpeg process per decoded frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegMediaInspector;

impl MediaInspector for FfmpegMediaInspector {
    fn duration_secs(&self, path: &Path) -> Result<f64, AppError> {
        Ok(get_video_metadata_impl(path)?.duration)
    }

    fn decode_frame(
        &self,
        path: &Path,
        timestamp_secs: f64,
        width: FrameWidth,
    ) -> Result<RgbImage, AppError> {
        let ffmpeg = get_ffmpeg_path()?;
        let args = build_frame_args(&path_to_string(path), timestamp_secs, width);
        let png = run_ffmpeg_capture(ffmpeg, &args)?;
        if png.is_empty() {
            return Err(AppError::input(format!(
                "No frame at {:.2}s in {}",
                timestamp_secs,
                path.display()
            )));
        }
        Ok(image::load_from_memory(&png)?.to_rgb8())
    }
}
