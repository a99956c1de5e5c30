//! Job queue facing the caller: submit, retry, cancel, process in waves, report.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::{OptimizationConfig, validate_source_extension};
use crate::engine::EngineLifecycleManager;
use crate::error::AppError;
use crate::pipeline::{JobFailure, JobOutput, JobPipeline, PercentCallback};
use crate::scheduler::{WaveReport, WaveScheduler};

pub type JobId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub source: PathBuf,
    #[serde(skip)]
    pub config: Arc<OptimizationConfig>,
    pub duration_seconds: Option<f64>,
    pub status: JobStatus,
    pub progress_percent: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum JobEvent {
    WaveStarted {
        wave: usize,
        total_waves: usize,
    },
    Progress {
        job_id: JobId,
        percent: u8,
    },
    Completed {
        job_id: JobId,
        encoded_byte_size: u64,
        achieved_bitrate_kbps: u64,
        thumbnail_count: usize,
        size_budget_exceeded: bool,
    },
    Failed {
        job_id: JobId,
        failure: JobFailure,
    },
}

pub type EventSink = Arc<dyn Fn(JobEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    /// Completed jobs whose output is still above the size limit.
    pub over_budget: usize,
}

pub struct BatchProcessor {
    pipeline: Arc<JobPipeline>,
    scheduler: WaveScheduler,
    jobs: Arc<Mutex<Vec<Job>>>,
    next_id: AtomicU64,
    events: Option<EventSink>,
    run_lock: tokio::sync::Mutex<()>,
}

impl BatchProcessor {
    pub fn new(pipeline: Arc<JobPipeline>, wave_size: usize) -> Self {
        let scheduler = WaveScheduler::new(Arc::clone(pipeline.engine()), wave_size);
        Self {
            pipeline,
            scheduler,
            jobs: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
            events: None,
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_events(mut self, sink: EventSink) -> Self {
        self.events = Some(sink);
        self
    }

    pub fn engine(&self) -> &Arc<EngineLifecycleManager> {
        self.pipeline.engine()
    }

    pub fn scheduler(&self) -> &WaveScheduler {
        &self.scheduler
    }

    /// Queues a job. The config is validated now and never changes afterwards.
    pub fn submit_job(
        &self,
        source: impl AsRef<Path>,
        config: OptimizationConfig,
    ) -> Result<JobId, AppError> {
        let source = source.as_ref();
        config.validate()?;
        validate_source_extension(source)?;
        let id = format!("job-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        self.jobs.lock().push(Job {
            id: id.clone(),
            source: source.to_path_buf(),
            config: Arc::new(config),
            duration_seconds: None,
            status: JobStatus::Pending,
            progress_percent: 0,
            result: None,
            error: None,
        });
        log::debug!(
            target: "budget_vid::batch",
            "Submitted {} for {}",
            id,
            source.display()
        );
        Ok(id)
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.lock().clone()
    }

    pub fn job(&self, id: &str) -> Option<Job> {
        self.jobs.lock().iter().find(|j| j.id == id).cloned()
    }

    pub fn summary(&self) -> BatchSummary {
        self.jobs
            .lock()
            .iter()
            .fold(BatchSummary::default(), |mut s, job| {
                s.total += 1;
                match job.status {
                    JobStatus::Pending => s.pending += 1,
                    JobStatus::Processing => s.processing += 1,
                    JobStatus::Completed => {
                        s.completed += 1;
                        if job.result.as_ref().is_some_and(|r| r.size_budget_exceeded) {
                            s.over_budget += 1;
                        }
                    }
                    JobStatus::Failed => s.failed += 1,
                }
                s
            })
    }

    /// Removes jobs that have not started. Returns their ids.
    pub fn cancel_pending_queue(&self) -> Vec<JobId> {
        let mut jobs = self.jobs.lock();
        let mut removed = Vec::new();
        jobs.retain(|j| {
            if j.status == JobStatus::Pending {
                removed.push(j.id.clone());
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            log::info!(
                target: "budget_vid::batch",
                "Cancelled {} pending jobs",
                removed.len()
            );
        }
        removed
    }

    /// Runs every pending job in waves.
    pub async fn process_all(&self) -> WaveReport {
        let _run = self.run_lock.lock().await;
        let ids = self.ids_with_status(JobStatus::Pending);
        self.run_in_waves(ids).await
    }

    /// Failed jobs go back to pending, the engine gets one unforced reset, and
    /// only those jobs are run again.
    pub async fn retry_failed(&self) -> WaveReport {
        let _run = self.run_lock.lock().await;
        let ids = self.ids_with_status(JobStatus::Failed);
        if ids.is_empty() {
            return WaveReport { waves: 0, jobs: 0 };
        }
        for id in &ids {
            self.update(id, mark_pending);
        }
        log::info!(
            target: "budget_vid::batch",
            "Retrying {} failed jobs",
            ids.len()
        );
        if let Err(e) = self.engine().reset(false).await {
            log::error!(
                target: "budget_vid::batch",
                "Engine reset before retry failed: {}",
                e
            );
        }
        self.run_in_waves(ids).await
    }

    /// Moves one failed job back to pending and runs it now.
    pub async fn retry_job(&self, id: &str) -> Result<Job, AppError> {
        let _run = self.run_lock.lock().await;
        let mut found = false;
        let mut failed = false;
        self.update(id, |job| {
            found = true;
            if job.status == JobStatus::Failed {
                failed = true;
                mark_pending(job);
            }
        });
        if !found {
            return Err(AppError::input(format!("Unknown job: {id}")));
        }
        if !failed {
            return Err(AppError::input(format!("Job {id} has not failed")));
        }
        self.run_one(id.to_string()).await;
        self.job(id)
            .ok_or_else(|| AppError::input(format!("Job {id} was removed")))
    }

    fn ids_with_status(&self, status: JobStatus) -> Vec<JobId> {
        self.jobs
            .lock()
            .iter()
            .filter(|j| j.status == status)
            .map(|j| j.id.clone())
            .collect()
    }

    async fn run_in_waves(&self, ids: Vec<JobId>) -> WaveReport {
        self.scheduler
            .run_waves(
                ids,
                |id| self.run_one(id),
                |wave, total_waves| self.emit(JobEvent::WaveStarted { wave, total_waves }),
            )
            .await
    }

    async fn run_one(&self, id: JobId) {
        let mut claimed = None;
        self.update(&id, |job| {
            if job.status == JobStatus::Pending {
                job.status = JobStatus::Processing;
                job.progress_percent = 0;
                claimed = Some((job.source.clone(), Arc::clone(&job.config)));
            }
        });
        // Cancelled or already handled.
        let Some((source, config)) = claimed else {
            return;
        };

        let progress = self.progress_callback(&id);
        match self.pipeline.run_job(&id, &source, config, Some(progress)).await {
            Ok(output) => {
                let event = JobEvent::Completed {
                    job_id: id.clone(),
                    encoded_byte_size: output.encoded_byte_size,
                    achieved_bitrate_kbps: output.achieved_bitrate_kbps,
                    thumbnail_count: output.thumbnails.len(),
                    size_budget_exceeded: output.size_budget_exceeded,
                };
                self.update(&id, |job| {
                    job.status = JobStatus::Completed;
                    job.progress_percent = 100;
                    job.duration_seconds = Some(output.duration_seconds);
                    job.result = Some(output);
                    job.error = None;
                });
                self.emit(event);
            }
            Err(e) => {
                let failure = JobFailure::from(&e);
                self.update(&id, |job| {
                    job.status = JobStatus::Failed;
                    job.error = Some(failure.clone());
                });
                self.emit(JobEvent::Failed {
                    job_id: id,
                    failure,
                });
            }
        }
    }

    fn progress_callback(&self, id: &str) -> PercentCallback {
        let jobs = Arc::clone(&self.jobs);
        let events = self.events.clone();
        let id = id.to_string();
        Arc::new(move |percent| {
            let changed = {
                let mut jobs = jobs.lock();
                match jobs.iter_mut().find(|j| j.id == id) {
                    Some(job) if job.progress_percent != percent => {
                        job.progress_percent = percent;
                        true
                    }
                    _ => false,
                }
            };
            if changed && let Some(sink) = events.as_ref() {
                sink(JobEvent::Progress {
                    job_id: id.clone(),
                    percent,
                });
            }
        })
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut Job)) {
        if let Some(job) = self.jobs.lock().iter_mut().find(|j| j.id == id) {
            f(job);
        }
    }

    fn emit(&self, event: JobEvent) {
        if let Some(sink) = self.events.as_ref() {
            sink(event);
        }
    }
}

fn mark_pending(job: &mut Job) {
    job.status = JobStatus::Pending;
    job.progress_percent = 0;
    job.error = None;
    job.result = None;
}
