//! Scripted collaborators for unit and integration tests.
//!
//! The scripted engine keeps files in memory, counts loads, terminations and
//! transcodes, and plays back a queue of per-exec outcomes.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use image::{Rgb, RgbImage};
use parking_lot::Mutex;

use crate::config::EngineTimeouts;
use crate::engine::{Engine, EngineLoader, MediaInspector};
use crate::error::AppError;
use crate::ffmpeg::{FrameWidth, ProgressCallback};
use crate::thumbnail::{FaceBox, FaceDetector};

/// Engine timeouts with zero settle intervals.
pub fn fast_timeouts() -> EngineTimeouts {
    EngineTimeouts::default().without_settle()
}

/// Writes a placeholder source file and returns its path.
pub fn write_source(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"not really a video").unwrap();
    path
}

/// Output size once the queued steps run out.
const DEFAULT_OUTPUT_BYTES: usize = 1024;

#[derive(Debug, Clone)]
pub enum ExecStep {
    /// Write an output of this many bytes.
    Output(usize),
    /// Fail with this stderr (memory-fault text is classified as such).
    Fail(String),
    /// Block until aborted.
    Hang,
}

/// Outcomes shared by every engine instance a loader creates.
pub struct Script {
    steps: Mutex<VecDeque<ExecStep>>,
    transcodes: AtomicUsize,
    pub abort_count: AtomicUsize,
    video_bitrates: Mutex<Vec<u64>>,
}

impl Script {
    fn new() -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            transcodes: AtomicUsize::new(0),
            abort_count: AtomicUsize::new(0),
            video_bitrates: Mutex::new(Vec::new()),
        }
    }

    pub fn push_output(&self, bytes: usize) {
        self.steps.lock().push_back(ExecStep::Output(bytes));
    }

    pub fn push_fail(&self, stderr: &str) {
        self.steps.lock().push_back(ExecStep::Fail(stderr.to_string()));
    }

    pub fn push_memory_fault(&self) {
        self.push_fail("RuntimeError: memory access out of bounds");
    }

    pub fn push_hang(&self) {
        self.steps.lock().push_back(ExecStep::Hang);
    }

    pub fn transcode_count(&self) -> usize {
        self.transcodes.load(Ordering::SeqCst)
    }

    /// `-b:v` of every exec, in call order.
    pub fn video_bitrates(&self) -> Vec<u64> {
        self.video_bitrates.lock().clone()
    }

    fn next_step(&self) -> ExecStep {
        self.steps
            .lock()
            .pop_front()
            .unwrap_or(ExecStep::Output(DEFAULT_OUTPUT_BYTES))
    }
}

pub struct ScriptedEngine {
    script: Arc<Script>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    aborted: AtomicBool,
    terminations: Arc<AtomicUsize>,
}

impl ScriptedEngine {
    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.files.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Engine for ScriptedEngine {
    fn write_file(&self, name: &str, data: &[u8]) -> Result<(), AppError> {
        self.files.lock().insert(name.to_string(), data.to_vec());
        Ok(())
    }

    fn read_file(&self, name: &str) -> Result<Vec<u8>, AppError> {
        self.files.lock().get(name).cloned().ok_or_else(|| {
            AppError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{name} not found"),
            ))
        })
    }

    fn delete_file(&self, name: &str) -> Result<(), AppError> {
        self.files.lock().remove(name);
        Ok(())
    }

    fn exec(
        &self,
        args: &[String],
        _duration_secs: Option<f64>,
        progress: Option<ProgressCallback>,
    ) -> Result<(), AppError> {
        self.script.transcodes.fetch_add(1, Ordering::SeqCst);
        if let Some(bps) = args
            .iter()
            .position(|a| a == "-b:v")
            .and_then(|i| args.get(i + 1))
            .and_then(|v| v.parse().ok())
        {
            self.script.video_bitrates.lock().push(bps);
        }
        let input = args
            .iter()
            .position(|a| a == "-i")
            .and_then(|i| args.get(i + 1))
            .cloned()
            .unwrap_or_default();
        if !self.files.lock().contains_key(&input) {
            return Err(AppError::ffmpeg_failed(1, format!("{input}: No such file")));
        }
        match self.script.next_step() {
            ExecStep::Output(bytes) => {
                if let Some(cb) = progress.as_ref() {
                    cb(0.5);
                    cb(1.0);
                }
                let output = args.last().cloned().unwrap_or_default();
                self.files.lock().insert(output, vec![0u8; bytes]);
                Ok(())
            }
            ExecStep::Fail(stderr) => Err(AppError::ffmpeg_failed(1, stderr)),
            ExecStep::Hang => {
                while !self.aborted.swap(false, Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(AppError::aborted())
            }
        }
    }

    fn abort(&self) {
        self.script.abort_count.fetch_add(1, Ordering::SeqCst);
        self.aborted.store(true, Ordering::SeqCst);
    }

    fn terminate(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.files.lock().clear();
        self.terminations.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct ScriptedEngineLoader {
    script: Arc<Script>,
    loads: AtomicUsize,
    failing_loads: AtomicUsize,
    terminations: Arc<AtomicUsize>,
    current: Mutex<Option<Arc<ScriptedEngine>>>,
}

impl Default for ScriptedEngineLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedEngineLoader {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Script::new()),
            loads: AtomicUsize::new(0),
            failing_loads: AtomicUsize::new(0),
            terminations: Arc::new(AtomicUsize::new(0)),
            current: Mutex::new(None),
        }
    }

    pub fn script(&self) -> &Script {
        &self.script
    }

    /// Successful loads only.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn termination_count(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    pub fn fail_next_loads(&self, n: usize) {
        self.failing_loads.store(n, Ordering::SeqCst);
    }

    /// Files held by the most recently loaded instance.
    pub fn current_files(&self) -> Vec<String> {
        self.current
            .lock()
            .as_ref()
            .map(|e| e.file_names())
            .unwrap_or_default()
    }
}

impl EngineLoader for ScriptedEngineLoader {
    fn load(&self) -> Result<Arc<dyn Engine>, AppError> {
        let failing = self
            .failing_loads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(AppError::from("scripted load failure"));
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        let engine = Arc::new(ScriptedEngine {
            script: Arc::clone(&self.script),
            files: Mutex::new(HashMap::new()),
            aborted: AtomicBool::new(false),
            terminations: Arc::clone(&self.terminations),
        });
        *self.current.lock() = Some(Arc::clone(&engine));
        Ok(engine)
    }
}

type LumaFn = dyn Fn(f64) -> u8 + Send + Sync;

/// Inspector returning a fixed duration and flat gray frames whose level is a function of time.
pub struct FakeInspector {
    duration: Option<f64>,
    luma: Box<LumaFn>,
    fail_decode: bool,
    decode_delay: Duration,
    decodes: AtomicUsize,
}

impl FakeInspector {
    /// Every frame is bright.
    pub fn new(duration: f64) -> Self {
        Self {
            duration: Some(duration),
            luma: Box::new(|_| 200),
            fail_decode: false,
            decode_delay: Duration::ZERO,
            decodes: AtomicUsize::new(0),
        }
    }

    /// Duration probing fails with an `Input` error.
    pub fn unreadable() -> Self {
        Self {
            duration: None,
            ..Self::new(0.0)
        }
    }

    pub fn with_luma(mut self, luma: impl Fn(f64) -> u8 + Send + Sync + 'static) -> Self {
        self.luma = Box::new(luma);
        self
    }

    pub fn failing_decode(mut self) -> Self {
        self.fail_decode = true;
        self
    }

    pub fn with_decode_delay(mut self, delay: Duration) -> Self {
        self.decode_delay = delay;
        self
    }

    pub fn decode_count(&self) -> usize {
        self.decodes.load(Ordering::SeqCst)
    }
}

impl MediaInspector for FakeInspector {
    fn duration_secs(&self, path: &Path) -> Result<f64, AppError> {
        self.duration
            .ok_or_else(|| AppError::input(format!("Could not read {}", path.display())))
    }

    fn decode_frame(
        &self,
        _path: &Path,
        timestamp_secs: f64,
        width: FrameWidth,
    ) -> Result<RgbImage, AppError> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        if !self.decode_delay.is_zero() {
            std::thread::sleep(self.decode_delay);
        }
        if self.fail_decode {
            return Err(AppError::input("scripted decode failure"));
        }
        let w = match width {
            FrameWidth::AtMost(w) => w.min(64),
            FrameWidth::Exact(w) => w,
        };
        let h = (w * 9 / 16).max(1);
        let level = (self.luma)(timestamp_secs);
        Ok(RgbImage::from_pixel(w, h, Rgb([level, level, level])))
    }
}

/// Face detector with fixed answers.
pub struct FixedFaceDetector {
    faces: Vec<FaceBox>,
    load_ok: bool,
    loads: AtomicUsize,
}

impl FixedFaceDetector {
    pub fn new(faces: Vec<FaceBox>) -> Self {
        Self {
            faces,
            load_ok: true,
            loads: AtomicUsize::new(0),
        }
    }

    pub fn failing_load() -> Self {
        Self {
            load_ok: false,
            ..Self::new(Vec::new())
        }
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl FaceDetector for FixedFaceDetector {
    fn ensure_loaded(&self) -> Result<(), AppError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.load_ok {
            Ok(())
        } else {
            Err(AppError::from("scripted model load failure"))
        }
    }

    fn detect(&self, _frame: &RgbImage) -> Result<Vec<FaceBox>, AppError> {
        Ok(self.faces.clone())
    }
}
