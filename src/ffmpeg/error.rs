//! Map FFmpeg exit codes to user-friendly messages and recognise engine memory faults.
//!
//! Exit codes are from ffmpeg.c: 1 (general), 69 (rate exceeded),
//! 123 (hard exit), 255 (signal). -1 is used for spawn failure.
//! Stderr is kept as detail for debugging.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// Error text that marks transient corruption of the engine's memory.
/// A job that hits one of these gets a forced engine reset and one more attempt.
static MEMORY_FAULT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)memory access out of bounds|cannot allocate memory|out of memory")
        .expect("invalid memory fault regex")
});

/// Payload for job error events. Frontend shows summary; detail is expandable.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FfmpegErrorPayload {
    pub summary: String,
    pub detail: String,
}

pub fn is_memory_fault(message: &str) -> bool {
    MEMORY_FAULT_RE.is_match(message)
}

/// Maps FFmpeg exit code to a short user-facing summary. Stderr is passed through as detail.
pub fn parse_ffmpeg_error(stderr: &str, exit_code: Option<i32>) -> FfmpegErrorPayload {
    let summary = match exit_code {
        Some(-1) => fallback_summary(stderr),
        Some(code) => match known_exit_code_summary(code) {
            Some(msg) => msg,
            None => format!("FFmpeg failed (exit code {}).", code),
        },
        None => fallback_summary(stderr),
    };
    let detail = stderr.trim().to_string();
    FfmpegErrorPayload { summary, detail }
}

fn known_exit_code_summary(code: i32) -> Option<String> {
    match code {
        1 => Some("FFmpeg failed.".into()),
        69 => Some("Encoding rate limit exceeded.".into()),
        123 | 255 => Some("Encoding was stopped.".into()),
        _ => None,
    }
}

const ELLIPSIS: &str = "…";

fn first_line_truncated(stderr: &str, max_len: usize) -> String {
    let first = stderr
        .lines()
        .find(|l| !l.trim().is_empty())
        .map(|l| l.trim())
        .unwrap_or(stderr);
    if first.len() <= max_len {
        return first.to_string();
    }
    let mut cut = max_len.saturating_sub(ELLIPSIS.len());
    while !first.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{}", &first[..cut], ELLIPSIS)
}

fn fallback_summary(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        return "FFmpeg not found or failed to start.".into();
    }
    first_line_truncated(stderr, 120)
}
