//! One job end to end: copy the source into the engine, encode to budget,
//! pick and render thumbnails, clean up. Memory faults get one forced reset
//! and one more attempt.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::budget::{EncodeAttempt, EncodeFiles, encode_to_budget, validate_duration};
use crate::config::OptimizationConfig;
use crate::engine::{EngineLease, EngineLifecycleManager, MediaInspector};
use crate::error::{AppError, ErrorKind};
use crate::ffmpeg::{ProgressCallback, progress_percent};
use crate::thumbnail::{
    DEFAULT_BRIGHTNESS_THRESHOLD, FaceDetector, InspectorProbe, Thumbnail, ThumbnailRenderer,
    select_timestamps,
};

/// Receives whole-percent job progress.
pub type PercentCallback = Arc<dyn Fn(u8) + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutput {
    #[serde(skip)]
    pub encoded_bytes: Vec<u8>,
    pub encoded_byte_size: u64,
    pub achieved_bitrate_kbps: u64,
    pub duration_seconds: f64,
    pub thumbnails: Vec<Thumbnail>,
    pub size_budget_exceeded: bool,
    pub attempts: Vec<EncodeAttempt>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&AppError> for JobFailure {
    fn from(e: &AppError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

pub struct JobPipeline {
    engine: Arc<EngineLifecycleManager>,
    inspector: Arc<dyn MediaInspector>,
    renderer: ThumbnailRenderer,
    file_counter: AtomicU64,
}

impl JobPipeline {
    pub fn new(
        engine: Arc<EngineLifecycleManager>,
        inspector: Arc<dyn MediaInspector>,
        faces: Arc<dyn FaceDetector>,
    ) -> Self {
        let renderer =
            ThumbnailRenderer::new(Arc::clone(&inspector), faces, engine.timeouts().clone());
        Self {
            engine,
            inspector,
            renderer,
            file_counter: AtomicU64::new(0),
        }
    }

    pub fn engine(&self) -> &Arc<EngineLifecycleManager> {
        &self.engine
    }

    /// Runs one job. A memory fault on the first try forces an engine reset and
    /// retries once; any second failure is final.
    pub async fn run_job(
        &self,
        job_id: &str,
        source: &Path,
        config: Arc<OptimizationConfig>,
        on_progress: Option<PercentCallback>,
    ) -> Result<JobOutput, AppError> {
        match self
            .run_once(job_id, source, &config, on_progress.clone())
            .await
        {
            Err(e) if e.is_memory_fault() => {
                log::warn!(
                    target: "budget_vid::pipeline",
                    "Job {} hit an engine memory fault; resetting engine and retrying: {}",
                    job_id,
                    e
                );
                if let Err(reset_err) = self.engine.reset(true).await {
                    // The retry's acquire loads a fresh instance on its own.
                    log::error!(
                        target: "budget_vid::pipeline",
                        "Engine reset after memory fault failed for job {}: {}",
                        job_id,
                        reset_err
                    );
                }
                self.run_once(job_id, source, &config, on_progress).await
            }
            other => other,
        }
    }

    async fn run_once(
        &self,
        job_id: &str,
        source: &Path,
        config: &OptimizationConfig,
        on_progress: Option<PercentCallback>,
    ) -> Result<JobOutput, AppError> {
        let files = self.next_files(source);
        let lease = self.engine.acquire(job_id).await?;
        log::info!(
            target: "budget_vid::pipeline",
            "Job {}: {} as {} -> {}",
            job_id,
            source.display(),
            files.input,
            files.output
        );

        let result = self
            .process(&lease, &files, source, config, on_progress)
            .await;
        self.cleanup(&lease, &files).await;
        drop(lease);

        match &result {
            Ok(out) => {
                log::info!(
                    target: "budget_vid::pipeline",
                    "Job {} done: {} bytes at {} kbps, {} thumbnails{}",
                    job_id,
                    out.encoded_byte_size,
                    out.achieved_bitrate_kbps,
                    out.thumbnails.len(),
                    if out.size_budget_exceeded { " (over limit)" } else { "" }
                );
                if let Err(e) = self.engine.job_finished().await {
                    log::error!(
                        target: "budget_vid::pipeline",
                        "Periodic engine reset failed: {}",
                        e
                    );
                }
            }
            Err(e) => log::warn!(
                target: "budget_vid::pipeline",
                "Job {} failed: {}",
                job_id,
                e
            ),
        }
        result
    }

    async fn process(
        &self,
        lease: &EngineLease,
        files: &EncodeFiles,
        source: &Path,
        config: &OptimizationConfig,
        on_progress: Option<PercentCallback>,
    ) -> Result<JobOutput, AppError> {
        let timeouts = self.engine.timeouts();
        let source_bytes = std::fs::metadata(source)
            .map_err(|e| AppError::input(format!("Cannot read {}: {}", source.display(), e)))?
            .len();

        let src = source.to_path_buf();
        let input = files.input.clone();
        lease
            .call(
                "Write input",
                timeouts.write_input_timeout(source_bytes),
                move |engine| {
                    let data = std::fs::read(&src).map_err(|e| {
                        AppError::input(format!("Cannot read {}: {}", src.display(), e))
                    })?;
                    engine.write_file(&input, &data)
                },
            )
            .await?;

        let duration = self
            .probe_duration(source, timeouts.metadata_timeout(source_bytes))
            .await?;
        validate_duration(duration)?;

        let progress: Option<ProgressCallback> = on_progress.map(|cb| {
            let forward: ProgressCallback = Arc::new(move |p| cb(progress_percent(p)));
            forward
        });
        let encoded =
            encode_to_budget(lease, files, duration, config, timeouts, progress).await?;

        let probe = Arc::new(InspectorProbe::new(
            Arc::clone(&self.inspector),
            source.to_path_buf(),
        ));
        let timestamps = select_timestamps(
            probe,
            duration,
            config.thumbnail_offset_seconds,
            DEFAULT_BRIGHTNESS_THRESHOLD,
            timeouts.thumbnail_search,
        )
        .await;
        let thumbnails = self
            .renderer
            .render_all(source, duration, &timestamps, config)
            .await;

        Ok(JobOutput {
            encoded_byte_size: encoded.bytes.len() as u64,
            encoded_bytes: encoded.bytes,
            achieved_bitrate_kbps: encoded.bitrate_kbps,
            duration_seconds: duration,
            thumbnails,
            size_budget_exceeded: encoded.size_budget_exceeded,
            attempts: encoded.attempts,
        })
    }

    async fn probe_duration(
        &self,
        source: &Path,
        limit: std::time::Duration,
    ) -> Result<f64, AppError> {
        let inspector = Arc::clone(&self.inspector);
        let path: PathBuf = source.to_path_buf();
        match tokio::time::timeout(
            limit,
            tokio::task::spawn_blocking(move || inspector.duration_secs(&path)),
        )
        .await
        {
            Ok(Ok(r)) => r,
            Ok(Err(join_err)) => Err(AppError::from(join_err.to_string())),
            Err(_) => Err(AppError::timeout("Read metadata", limit)),
        }
    }

    /// Deletes both engine files. Failures are logged only.
    async fn cleanup(&self, lease: &EngineLease, files: &EncodeFiles) {
        let limit = self.engine.timeouts().cleanup;
        for name in [&files.input, &files.output] {
            let owned = name.clone();
            if let Err(e) = lease
                .call("Cleanup", limit, move |engine| engine.delete_file(&owned))
                .await
            {
                log::debug!(
                    target: "budget_vid::pipeline",
                    "Cleanup of {} failed: {}",
                    name,
                    e
                );
            }
        }
    }

    /// `input_<millis>_<n>.<ext>` / `output_<millis>_<n>.mp4`, unique per call.
    fn next_files(&self, source: &Path) -> EncodeFiles {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let n = self.file_counter.fetch_add(1, Ordering::Relaxed);
        let ext = source
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| "mp4".to_string());
        EncodeFiles {
            input: format!("input_{millis}_{n}.{ext}"),
            output: format!("output_{millis}_{n}.mp4"),
        }
    }
}
