//! FFprobe-based video metadata extraction.

use crate::error::AppError;
use serde::Deserialize;
use std::path::Path;
use std::process::Command;

use super::discovery::get_ffprobe_path;

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    size: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    codec_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
    streams: Option<Vec<FfprobeStream>>,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoMetadata {
    /// Seconds; 0.0 when neither the container nor the video stream reports one.
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    pub size: u64,
    pub codec_name: Option<String>,
}

/// Parse ffprobe JSON output into VideoMetadata.
pub fn parse_ffprobe_json(json: &str) -> Result<VideoMetadata, AppError> {
    let output: FfprobeOutput = serde_json::from_str(json)
        .map_err(|e| AppError::input(format!("Failed to parse ffprobe JSON: {}", e)))?;

    let format = output.format.as_ref();
    let video_stream = output.streams.as_ref().and_then(|streams| {
        streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
    });

    // Container duration first, video stream duration as fallback.
    let duration = format
        .and_then(|f| f.duration.as_deref())
        .or_else(|| video_stream.and_then(|s| s.duration.as_deref()))
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0);
    let size = format
        .and_then(|f| f.size.as_ref())
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    Ok(VideoMetadata {
        duration,
        width: video_stream.and_then(|s| s.width).unwrap_or(0),
        height: video_stream.and_then(|s| s.height).unwrap_or(0),
        size,
        codec_name: video_stream.and_then(|s| s.codec_name.clone()),
    })
}

/// Run ffprobe on a video file and return metadata.
pub fn get_video_metadata_impl(path: &Path) -> Result<VideoMetadata, AppError> {
    let ffprobe = get_ffprobe_path()?;
    let path_str = path.to_string_lossy();

    log::debug!(
        target: "budget_vid::ffmpeg::ffprobe",
        "get_video_metadata: path={}",
        path_str
    );

    let output = Command::new(&ffprobe)
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
            &path_str,
        ])
        .output()
        .map_err(|e| AppError::from(format!("Failed to run ffprobe: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AppError::input(format!(
            "Could not read video file {}: {}",
            path.display(),
            stderr.trim()
        )));
    }

    let json = String::from_utf8(output.stdout)
        .map_err(|_| AppError::input("ffprobe output was not valid UTF-8"))?;

    parse_ffprobe_json(&json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ffprobe_json_extracts_metadata() {
        let json = r#"{
            "format": {
                "duration": "30.5",
                "size": "12345678"
            },
            "streams": [
                {
                    "codec_type": "video",
                    "codec_name": "h264",
                    "width": 1920,
                    "height": 1080
                }
            ]
        }"#;
        let meta = parse_ffprobe_json(json).unwrap();
        assert_eq!(meta.duration, 30.5);
        assert_eq!(meta.width, 1920);
        assert_eq!(meta.height, 1080);
        assert_eq!(meta.size, 12_345_678);
        assert_eq!(meta.codec_name.as_deref(), Some("h264"));
    }

    #[test]
    fn stream_duration_used_when_format_has_none() {
        let json = r#"{
            "format": { "size": "1000" },
            "streams": [{"codec_type": "video", "width": 640, "height": 360, "duration": "4.25"}]
        }"#;
        let meta = parse_ffprobe_json(json).unwrap();
        assert_eq!(meta.duration, 4.25);
    }

    #[test]
    fn parse_ffprobe_json_handles_missing_video_stream() {
        let json = r#"{
            "format": { "duration": "10.0", "size": "1000" },
            "streams": [{"codec_type": "audio"}]
        }"#;
        let meta = parse_ffprobe_json(json).unwrap();
        assert_eq!(meta.duration, 10.0);
        assert_eq!(meta.width, 0);
        assert_eq!(meta.height, 0);
    }

    #[test]
    fn parse_ffprobe_json_handles_empty_output() {
        let meta = parse_ffprobe_json(r#"{"format": {}, "streams": []}"#).unwrap();
        assert_eq!(meta.duration, 0.0);
        assert_eq!(meta.size, 0);
    }

    #[test]
    fn malformed_json_is_an_input_error() {
        let err = parse_ffprobe_json("not json").unwrap_err();
        assert!(matches!(err, AppError::Input(_)));
    }
}
