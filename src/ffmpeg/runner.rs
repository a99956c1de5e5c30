//! FFmpeg process spawning and progress parsing.
//!
//! Spawns FFmpeg as a child process, parses progress from stdout (pipe:1),
//! and forwards it to an optional callback. Uses background threads to read
//! the progress and stderr streams while the calling thread waits for completion.

use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Child, Command, Stdio};

#[cfg(windows)]
use std::os::windows::process::CommandExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::progress::parse_ffmpeg_progress;
use crate::error::AppError;

/// Receives normalized progress in [0,1].
pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// Sentinel for "duration not yet known". AtomicU64 cannot hold Option<f64>,
/// so we encode duration as f64 bits; u64::MAX means "not yet known".
const NONE_DURATION_BITS: u64 = u64::MAX;

/// Minimum interval between progress emits.
const PROGRESS_EMIT_INTERVAL: Duration = Duration::from_millis(150);
/// Keep only the last N bytes of stderr to avoid unbounded memory growth.
const MAX_STDERR_BYTES: usize = 64 * 1024;

/// The single in-flight FFmpeg child of one engine instance.
#[derive(Default)]
pub struct ProcessSlot {
    child: Mutex<Option<Child>>,
}

impl ProcessSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kills the in-flight child, if any. The waiting runner then reports `Aborted`.
    pub fn terminate(&self) {
        let mut guard = self.child.lock();
        if let Some(mut child) = guard.take() {
            log::info!(
                target: "budget_vid::ffmpeg::runner",
                "Terminating FFmpeg process"
            );
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

struct ReadStreamConfig {
    collect_stderr: Option<Arc<Mutex<Vec<u8>>>>,
    duration: Arc<AtomicU64>,
    progress_callback: Option<ProgressCallback>,
}

fn read_stream<R: std::io::Read + Send + 'static>(
    reader: R,
    config: ReadStreamConfig,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let load_duration = || {
            let bits = config.duration.load(Ordering::Relaxed);
            if bits == NONE_DURATION_BITS {
                None
            } else {
                Some(f64::from_bits(bits))
            }
        };
        let mut current_duration = load_duration();
        let mut last_emit = Instant::now();
        let mut last_progress = 0.0_f64;
        let mut stream_reader = BufReader::new(reader);
        let mut line_buf = Vec::with_capacity(256);
        while stream_reader.read_until(b'\n', &mut line_buf).unwrap_or(0) > 0 {
            let line = std::str::from_utf8(&line_buf)
                .unwrap_or("")
                .trim_end_matches(['\n', '\r']);
            if let Some(ref buf) = config.collect_stderr {
                let mut guard = buf.lock();
                guard.extend_from_slice(line.as_bytes());
                guard.push(b'\n');
                if guard.len() > MAX_STDERR_BYTES {
                    let excess = guard.len() - MAX_STDERR_BYTES;
                    guard.drain(..excess);
                }
            }
            let (progress, d) = parse_ffmpeg_progress(line, current_duration);
            if let Some(new_dur) = d {
                current_duration = Some(new_dur);
                config.duration.store(new_dur.to_bits(), Ordering::Relaxed);
            }
            if let (Some(p), Some(cb)) = (progress, config.progress_callback.as_ref()) {
                let now = Instant::now();
                let should_emit = now.duration_since(last_emit) >= PROGRESS_EMIT_INTERVAL
                    || (p - last_progress).abs() >= 0.01
                    || p >= 1.0;
                if should_emit {
                    last_emit = now;
                    last_progress = p;
                    cb(p);
                }
            }
            line_buf.clear();
        }
    })
}

/// Run FFmpeg and block until completion.
///
/// - `working_dir`: relative input/output names in `args` resolve against it.
/// - `duration_secs`: If provided, initializes shared duration so progress can be computed
///   immediately from out_time_ms (avoids race with Duration line on stderr).
/// - `slot`: holds the child while it runs so another thread can kill it through
///   [`ProcessSlot::terminate`]; the run then returns `AppError::Aborted`.
pub fn run_ffmpeg_blocking(
    ffmpeg: &Path,
    args: &[String],
    working_dir: Option<&Path>,
    duration_secs: Option<f64>,
    progress_callback: Option<ProgressCallback>,
    slot: &ProcessSlot,
) -> Result<(), AppError> {
    let input_arg = args
        .iter()
        .position(|a| a == "-i")
        .and_then(|i| args.get(i + 1));
    log::debug!(
        target: "budget_vid::ffmpeg::runner",
        "Spawning FFmpeg: path={}, input={:?}, output={:?}",
        ffmpeg.display(),
        input_arg,
        args.last()
    );

    let mut cmd = Command::new(ffmpeg);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    #[cfg(windows)]
    cmd.creation_flags(0x08000000); // CREATE_NO_WINDOW
    let mut child = cmd
        .spawn()
        .map_err(|e| format!("Failed to spawn FFmpeg: {}", e))?;

    let Some(stdout) = child.stdout.take() else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(AppError::from("Failed to capture stdout"));
    };
    let Some(stderr) = child.stderr.take() else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(AppError::from("Failed to capture stderr"));
    };

    *slot.child.lock() = Some(child);

    let duration = Arc::new(AtomicU64::new(
        duration_secs
            .filter(|&d| d > 0.0)
            .map(f64::to_bits)
            .unwrap_or(NONE_DURATION_BITS),
    ));
    let stderr_buffer = Arc::new(Mutex::new(Vec::new()));

    let stdout_handle = read_stream(
        stdout,
        ReadStreamConfig {
            collect_stderr: None,
            duration: Arc::clone(&duration),
            progress_callback,
        },
    );
    let stderr_handle = read_stream(
        stderr,
        ReadStreamConfig {
            collect_stderr: Some(Arc::clone(&stderr_buffer)),
            duration: Arc::clone(&duration),
            progress_callback: None,
        },
    );

    let _ = stdout_handle.join();
    let _ = stderr_handle.join();

    let child = slot.child.lock().take();
    let status = match child {
        Some(mut c) => c.wait()?,
        None => {
            log::warn!(
                target: "budget_vid::ffmpeg::runner",
                "FFmpeg process was aborted (terminated externally)"
            );
            return Err(AppError::aborted());
        }
    };

    let stderr_str = String::from_utf8_lossy(&stderr_buffer.lock()).to_string();

    if status.success() {
        log::debug!(
            target: "budget_vid::ffmpeg::runner",
            "FFmpeg completed successfully"
        );
        Ok(())
    } else {
        let code = status.code().unwrap_or(-1);
        let err_preview = stderr_str
            .lines()
            .rev()
            .take(3)
            .collect::<Vec<_>>()
            .join("; ");
        log::error!(
            target: "budget_vid::ffmpeg::runner",
            "FFmpeg failed (code={}): {}",
            code,
            err_preview
        );
        Err(AppError::ffmpeg_failed(code, stderr_str))
    }
}

/// Run FFmpeg to completion and return everything it wrote to stdout.
/// Used for single-frame decodes piped as images.
pub fn run_ffmpeg_capture(ffmpeg: &Path, args: &[String]) -> Result<Vec<u8>, AppError> {
    let mut cmd = Command::new(ffmpeg);
    cmd.args(args).stdin(Stdio::null());
    #[cfg(windows)]
    cmd.creation_flags(0x08000000); // CREATE_NO_WINDOW
    let output = cmd
        .output()
        .map_err(|e| format!("Failed to spawn FFmpeg: {}", e))?;
    if !output.status.success() {
        let code = output.status.code().unwrap_or(-1);
        return Err(AppError::ffmpeg_failed(
            code,
            String::from_utf8_lossy(&output.stderr).to_string(),
        ));
    }
    Ok(output.stdout)
}
