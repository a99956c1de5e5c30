#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;

use budget_vid::config::OptimizationConfig;
use budget_vid::engine::{EngineLifecycleManager, EngineLoader, MediaInspector};
use budget_vid::test_support::{FakeInspector, ScriptedEngineLoader, fast_timeouts, write_source};
use budget_vid::thumbnail::DisabledFaceDetector;
use budget_vid::{BatchProcessor, JobEvent, JobId, JobPipeline};
use parking_lot::Mutex;

/// Batch processor over the scripted engine, recording every event.
pub struct FakeBatch {
    pub loader: Arc<ScriptedEngineLoader>,
    pub batch: BatchProcessor,
    pub events: Arc<Mutex<Vec<JobEvent>>>,
    dir: tempfile::TempDir,
}

impl FakeBatch {
    pub fn new(wave_size: usize) -> Self {
        Self::with_inspector(wave_size, FakeInspector::new(10.0))
    }

    pub fn with_inspector(wave_size: usize, inspector: FakeInspector) -> Self {
        let loader = Arc::new(ScriptedEngineLoader::new());
        let batch = batch_over(loader.clone(), Arc::new(inspector), wave_size);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let batch = batch.with_events(Arc::new(move |e| sink.lock().push(e)));
        Self {
            loader,
            batch,
            events,
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    /// Submits `count` placeholder sources named `clip_NN.mp4`.
    pub fn submit_many(&self, count: usize, config: &OptimizationConfig) -> Vec<JobId> {
        (0..count)
            .map(|i| {
                let path = write_source(self.dir.path(), &format!("clip_{i:02}.mp4"));
                self.batch
                    .submit_job(path, config.clone())
                    .expect("submit_job")
            })
            .collect()
    }

    pub fn wave_starts(&self) -> Vec<(usize, usize)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                JobEvent::WaveStarted { wave, total_waves } => Some((*wave, *total_waves)),
                _ => None,
            })
            .collect()
    }

    pub fn failed_ids(&self) -> Vec<JobId> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                JobEvent::Failed { job_id, .. } => Some(job_id.clone()),
                _ => None,
            })
            .collect()
    }
}

pub fn batch_over(
    loader: Arc<dyn EngineLoader>,
    inspector: Arc<dyn MediaInspector>,
    wave_size: usize,
) -> BatchProcessor {
    let engine = Arc::new(EngineLifecycleManager::new(loader, fast_timeouts()));
    let pipeline = Arc::new(JobPipeline::new(
        engine,
        inspector,
        Arc::new(DisabledFaceDetector),
    ));
    BatchProcessor::new(pipeline, wave_size)
}

/// Budget numbers used throughout the walkthrough scenarios.
pub fn scenario_config() -> OptimizationConfig {
    OptimizationConfig {
        target_size_bytes: 1_572_864,
        max_limit_bytes: 2_097_152,
        audio_bitrate_bps: 128_000,
        min_video_bitrate_bps: 300_000,
        thumbnail_width_px: 48,
        ..Default::default()
    }
}

/// Real FFmpeg environment. `None` when FFmpeg or libx264 is unavailable.
pub struct IntegrationEnv {
    pub ffmpeg: PathBuf,
    dir: tempfile::TempDir,
}

impl IntegrationEnv {
    pub fn try_new() -> Option<Self> {
        let ffmpeg = match budget_vid::ffmpeg::discovery::get_ffmpeg_path() {
            Ok(path) => path.to_path_buf(),
            Err(e) => {
                eprintln!("skipping: {e}");
                return None;
            }
        };
        let encoders = budget_vid::ffmpeg::discovery::get_available_encoders().ok()?;
        if !encoders.iter().any(|e| e == "libx264") {
            eprintln!("skipping: FFmpeg at {} has no libx264", ffmpeg.display());
            return None;
        }
        let dir = tempfile::tempdir().expect("tempdir");
        Some(Self { ffmpeg, dir })
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn with_test_video(&self, name: &str, duration_secs: f32) -> PathBuf {
        let path = self.path(name);
        let status = create_test_video(&self.ffmpeg, &path, duration_secs)
            .expect("failed to create test video");
        assert!(status.success(), "ffmpeg failed to create test video");
        path
    }
}

/// Test pattern plus a sine tone; the first second is black.
pub fn create_test_video(
    ffmpeg: &Path,
    output_path: &Path,
    duration_secs: f32,
) -> std::io::Result<ExitStatus> {
    let duration_arg = format!("{}", duration_secs);
    Command::new(ffmpeg)
        .args([
            "-loglevel",
            "error",
            "-y",
            "-f",
            "lavfi",
            "-i",
            &format!("testsrc=duration={}:size=320x240:rate=30", duration_arg),
            "-f",
            "lavfi",
            "-i",
            &format!("sine=frequency=440:duration={}", duration_arg),
            "-vf",
            "fade=in:st=0:d=1",
            "-c:v",
            "libx264",
            "-pix_fmt",
            "yuv420p",
            "-c:a",
            "aac",
            "-shortest",
            output_path.to_string_lossy().as_ref(),
        ])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
}
