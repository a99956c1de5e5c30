//! App error type for the optimizer core. Implements Display and Serialize for the sidecar.

use std::time::Duration;

use crate::ffmpeg::{is_memory_fault, parse_ffmpeg_error};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    FfmpegNotFound(String),

    /// Unreadable, corrupt or zero-duration source, or an invalid config.
    #[error("{0}")]
    Input(String),

    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout { operation: String, after: Duration },

    #[error("Engine memory fault: {0}")]
    EngineMemoryFault(String),

    #[error("FFmpeg failed (code {code}): {stderr}")]
    FfmpegFailed { code: i32, stderr: String },

    #[error("Failed to load encoding engine: {0}")]
    EngineLoad(String),

    /// The engine was reset while a lease from an older generation was still held.
    #[error("Engine was reset (lease generation {lease}, current {current})")]
    EngineReset { lease: u64, current: u64 },

    #[error("Aborted")]
    Aborted,
}

/// Outbound failure classification reported per job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Input,
    Timeout,
    EngineMemoryFault,
    Engine,
    Io,
    Aborted,
}

impl AppError {
    pub fn aborted() -> Self {
        Self::Aborted
    }

    pub fn input(message: impl Into<String>) -> Self {
        Self::Input(message.into())
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    pub fn ffmpeg_failed(code: i32, stderr: impl Into<String>) -> Self {
        let stderr = stderr.into();
        if is_memory_fault(&stderr) {
            return Self::EngineMemoryFault(stderr);
        }
        Self::FfmpegFailed { code, stderr }
    }

    pub fn is_memory_fault(&self) -> bool {
        matches!(self, AppError::EngineMemoryFault(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Input(_) => ErrorKind::Input,
            AppError::Timeout { .. } => ErrorKind::Timeout,
            AppError::EngineMemoryFault(_) => ErrorKind::EngineMemoryFault,
            AppError::Io(_) => ErrorKind::Io,
            AppError::Aborted => ErrorKind::Aborted,
            AppError::FfmpegNotFound(_)
            | AppError::FfmpegFailed { .. }
            | AppError::EngineLoad(_)
            | AppError::EngineReset { .. } => ErrorKind::Engine,
        }
    }
}

impl serde::Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            AppError::FfmpegFailed { code, stderr } => {
                let payload = parse_ffmpeg_error(stderr, Some(*code));
                let json =
                    serde_json::json!({ "summary": payload.summary, "detail": payload.detail });
                serializer.serialize_str(&json.to_string())
            }
            _ => serializer.serialize_str(&self.to_string()),
        }
    }
}

impl From<String> for AppError {
    fn from(s: String) -> Self {
        if s == "Aborted" {
            AppError::Aborted
        } else {
            AppError::ffmpeg_failed(-1, s)
        }
    }
}

impl From<&str> for AppError {
    fn from(s: &str) -> Self {
        s.to_string().into()
    }
}

impl From<image::ImageError> for AppError {
    fn from(e: image::ImageError) -> Self {
        AppError::input(format!("Image processing failed: {}", e))
    }
}
