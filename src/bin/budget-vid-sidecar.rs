use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use budget_vid::config::{OptimizationConfig, Settings};
use budget_vid::engine::EngineLifecycleManager;
use budget_vid::error::AppError;
use budget_vid::ffmpeg::discovery::{get_available_encoders, get_ffmpeg_path};
use budget_vid::ffmpeg::{FfmpegEngineLoader, FfmpegMediaInspector, parse_ffmpeg_error};
use budget_vid::thumbnail::DisabledFaceDetector;
use budget_vid::{BatchProcessor, JobEvent, JobPipeline, JobStatus};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

const PROTOCOL_VERSION: u8 = 1;

#[derive(Debug, Deserialize)]
struct RpcRequest {
    id: u64,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, serde::Serialize)]
struct RpcSuccess {
    id: u64,
    result: Value,
}

#[derive(Debug, serde::Serialize)]
struct RpcFailure {
    id: u64,
    error: RpcErrorPayload,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct RpcErrorPayload {
    summary: String,
    detail: String,
}

#[derive(Debug, serde::Serialize)]
struct RpcEvent {
    event: String,
    payload: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitParams {
    input_path: PathBuf,
    /// Defaults to the source's directory.
    output_dir: Option<PathBuf>,
    /// Keys override the settings file's optimization section.
    #[serde(default)]
    config: Option<serde_json::Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetryParams {
    job_id: String,
}

type SharedWriter = Arc<Mutex<io::Stdout>>;

fn write_json_line<T: serde::Serialize>(writer: &mut impl Write, value: &T) -> io::Result<()> {
    serde_json::to_writer(&mut *writer, value)
        .map_err(|e| io::Error::other(format!("serialize response: {}", e)))?;
    writer.write_all(b"\n")?;
    writer.flush()
}

fn write_json_line_shared<T: serde::Serialize>(writer: &SharedWriter, value: &T) -> io::Result<()> {
    let mut guard = writer.lock();
    write_json_line(&mut *guard, value)
}

fn emit_rpc_event(writer: &SharedWriter, event: &str, payload: Value) {
    let message = RpcEvent {
        event: event.to_string(),
        payload,
    };
    let _ = write_json_line_shared(writer, &message);
}

fn emit_job_event(writer: &SharedWriter, event: &JobEvent) {
    let name = match event {
        JobEvent::WaveStarted { .. } => "queue.wave",
        JobEvent::Progress { .. } => "job.progress",
        JobEvent::Completed { .. } => "job.complete",
        JobEvent::Failed { .. } => "job.error",
    };
    match serde_json::to_value(event) {
        Ok(payload) => emit_rpc_event(writer, name, payload),
        Err(e) => log::error!(target: "budget_vid::sidecar", "serialize event: {}", e),
    }
}

fn parse_error_payload(err: &AppError) -> RpcErrorPayload {
    match err {
        AppError::FfmpegFailed { code, stderr } if *code != -1 => {
            let parsed = parse_ffmpeg_error(stderr, Some(*code));
            RpcErrorPayload {
                summary: parsed.summary,
                detail: parsed.detail,
            }
        }
        _ => {
            let text = err.to_string();
            RpcErrorPayload {
                summary: text.clone(),
                detail: text,
            }
        }
    }
}

fn params_from_value<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, AppError> {
    serde_json::from_value(params)
        .map_err(|e| AppError::input(format!("Invalid params payload: {}", e)))
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, AppError> {
    serde_json::to_value(value).map_err(|e| AppError::from(format!("Failed to serialize: {}", e)))
}

fn is_async_request(method: &str) -> bool {
    matches!(method, "queue.process" | "queue.retryFailed" | "job.retry")
}

/// Clears the running flag when a queue run ends, however it ends.
struct RunGuard(Arc<AtomicBool>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct Sidecar {
    batch: BatchProcessor,
    defaults: OptimizationConfig,
    output_dirs: Mutex<HashMap<String, PathBuf>>,
    running: Arc<AtomicBool>,
    writer: SharedWriter,
}

impl Sidecar {
    fn new(settings: Settings, writer: SharedWriter) -> Self {
        let engine = EngineLifecycleManager::new(
            Arc::new(FfmpegEngineLoader::default()),
            settings.timeouts.clone(),
        )
        .with_periodic_reset(settings.scheduler.reset_every_jobs);
        let pipeline = Arc::new(JobPipeline::new(
            Arc::new(engine),
            Arc::new(FfmpegMediaInspector),
            Arc::new(DisabledFaceDetector),
        ));
        let events = Arc::clone(&writer);
        let batch = BatchProcessor::new(pipeline, settings.scheduler.wave_size)
            .with_events(Arc::new(move |event| emit_job_event(&events, &event)));
        Self {
            batch,
            defaults: settings.optimization,
            output_dirs: Mutex::new(HashMap::new()),
            running: Arc::new(AtomicBool::new(false)),
            writer,
        }
    }

    fn begin_run(&self) -> Result<RunGuard, AppError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AppError::from("A queue run is already in progress"));
        }
        Ok(RunGuard(Arc::clone(&self.running)))
    }

    fn dispatch_sync(&self, method: &str, params: Value) -> Result<Value, AppError> {
        match method {
            "app.capabilities" => {
                let ffmpeg = get_ffmpeg_path()?;
                Ok(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "ffmpegPath": ffmpeg.display().to_string(),
                    "encoders": get_available_encoders()?,
                    "faceDetection": false,
                    "waveSize": self.batch.scheduler().wave_size(),
                }))
            }
            "job.submit" => {
                let parsed: SubmitParams = params_from_value(params)?;
                let config = self.merge_config(parsed.config)?;
                let output_dir = match parsed.output_dir {
                    Some(dir) => dir,
                    None => parsed
                        .input_path
                        .parent()
                        .map(Path::to_path_buf)
                        .unwrap_or_default(),
                };
                let job_id = self.batch.submit_job(&parsed.input_path, config)?;
                self.output_dirs.lock().insert(job_id.clone(), output_dir);
                Ok(json!({ "jobId": job_id }))
            }
            "queue.cancelPending" => {
                let removed = self.batch.cancel_pending_queue();
                let mut dirs = self.output_dirs.lock();
                for id in &removed {
                    dirs.remove(id);
                }
                Ok(json!({ "cancelled": removed }))
            }
            "queue.status" => Ok(json!({
                "summary": to_value(&self.batch.summary())?,
                "running": self.running.load(Ordering::SeqCst),
                "currentWave": self.batch.scheduler().current_wave(),
                "totalWaves": self.batch.scheduler().total_waves(),
                "engineState": to_value(&self.batch.engine().state())?,
                "jobs": to_value(&self.batch.jobs())?,
            })),
            _ => Err(AppError::from(format!("Unknown method: {}", method))),
        }
    }

    async fn dispatch_async(&self, method: &str, params: Value) -> Result<Value, AppError> {
        let _run = self.begin_run()?;
        let result = match method {
            "queue.process" => to_value(&self.batch.process_all().await)?,
            "queue.retryFailed" => to_value(&self.batch.retry_failed().await)?,
            "job.retry" => {
                let parsed: RetryParams = params_from_value(params)?;
                to_value(&self.batch.retry_job(&parsed.job_id).await?)?
            }
            _ => return Err(AppError::from(format!("Unknown method: {}", method))),
        };
        self.save_completed();
        Ok(result)
    }

    fn merge_config(
        &self,
        overrides: Option<serde_json::Map<String, Value>>,
    ) -> Result<OptimizationConfig, AppError> {
        let Some(overrides) = overrides else {
            return Ok(self.defaults.clone());
        };
        let mut base = to_value(&self.defaults)?;
        if let Value::Object(map) = &mut base {
            map.extend(overrides);
        }
        serde_json::from_value(base).map_err(|e| AppError::input(format!("Invalid config: {}", e)))
    }

    /// Writes `<stem>_opt.mp4` and `<stem>_thumb_0N.jpg` for every completed job not yet saved.
    fn save_completed(&self) {
        for job in self.batch.jobs() {
            if job.status != JobStatus::Completed {
                continue;
            }
            let Some(dir) = self.output_dirs.lock().remove(&job.id) else {
                continue;
            };
            let Some(output) = job.result.as_ref() else {
                continue;
            };
            let stem = job
                .source
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| job.id.clone());
            match write_outputs(&dir, &stem, output) {
                Ok(paths) => emit_rpc_event(
                    &self.writer,
                    "job.saved",
                    json!({ "jobId": job.id, "paths": paths }),
                ),
                Err(e) => {
                    log::error!(
                        target: "budget_vid::sidecar",
                        "Saving outputs of {} failed: {}",
                        job.id,
                        e
                    );
                    let payload = parse_error_payload(&e);
                    emit_rpc_event(
                        &self.writer,
                        "job.saveError",
                        json!({ "jobId": job.id, "summary": payload.summary, "detail": payload.detail }),
                    );
                }
            }
        }
    }

    fn respond(&self, id: u64, result: Result<Value, AppError>) {
        let outcome = match result {
            Ok(result) => write_json_line_shared(&self.writer, &RpcSuccess { id, result }),
            Err(err) => write_json_line_shared(
                &self.writer,
                &RpcFailure {
                    id,
                    error: parse_error_payload(&err),
                },
            ),
        };
        if let Err(e) = outcome {
            log::error!(target: "budget_vid::sidecar", "Writing response {} failed: {}", id, e);
        }
    }
}

fn write_outputs(
    dir: &Path,
    stem: &str,
    output: &budget_vid::JobOutput,
) -> Result<Vec<String>, AppError> {
    std::fs::create_dir_all(dir)?;
    let mut paths = Vec::with_capacity(output.thumbnails.len() + 1);
    let video = dir.join(format!("{stem}_opt.mp4"));
    std::fs::write(&video, &output.encoded_bytes)?;
    paths.push(video.display().to_string());
    for (i, thumb) in output.thumbnails.iter().enumerate() {
        let path = dir.join(format!("{stem}_thumb_{:02}.jpg", i + 1));
        std::fs::write(&path, &thumb.image_bytes)?;
        paths.push(path.display().to_string());
    }
    Ok(paths)
}

fn load_settings() -> Result<Settings, AppError> {
    match std::env::args_os().nth(1) {
        Some(path) => {
            log::info!(
                target: "budget_vid::sidecar",
                "Loading settings from {}",
                Path::new(&path).display()
            );
            Settings::from_json_file(Path::new(&path))
        }
        None => Ok(Settings::default()),
    }
}

async fn serve(settings: Settings) {
    let writer: SharedWriter = Arc::new(Mutex::new(io::stdout()));
    let sidecar = Arc::new(Sidecar::new(settings, Arc::clone(&writer)));

    // Stdin stays on a plain thread; lines are handed to the runtime.
    let (tx, mut rx) = mpsc::unbounded_channel::<io::Result<String>>();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    let mut workers = JoinSet::new();
    while let Some(line) = rx.recv().await {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                let failure = RpcFailure {
                    id: 0,
                    error: RpcErrorPayload {
                        summary: "Invalid input stream".to_string(),
                        detail: err.to_string(),
                    },
                };
                let _ = write_json_line_shared(&writer, &failure);
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let request: RpcRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                let failure = RpcFailure {
                    id: 0,
                    error: RpcErrorPayload {
                        summary: "Invalid request".to_string(),
                        detail: err.to_string(),
                    },
                };
                let _ = write_json_line_shared(&writer, &failure);
                continue;
            }
        };

        if is_async_request(&request.method) {
            let sidecar = Arc::clone(&sidecar);
            workers.spawn(async move {
                let result = sidecar
                    .dispatch_async(&request.method, request.params)
                    .await;
                sidecar.respond(request.id, result);
            });
        } else {
            let result = sidecar.dispatch_sync(&request.method, request.params);
            sidecar.respond(request.id, result);
        }
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            log::error!(target: "budget_vid::sidecar", "Worker panicked: {}", e);
        }
    }
    sidecar.batch.engine().shutdown().await;
}

fn main() -> io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let settings = load_settings().map_err(|e| io::Error::other(e.to_string()))?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(settings));
    Ok(())
}
