//! Ownership of the single engine instance: lazy load, leases, reset and shutdown.
//!
//! State machine: `Unloaded -> Loading -> Ready -> (Resetting -> Loading -> Ready | Terminated)`.
//! Every reset bumps a generation counter; a lease taken under an older
//! generation reports [`AppError::EngineReset`] instead of engine errors.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use super::{Engine, EngineLoader};
use crate::config::EngineTimeouts;
use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EngineState {
    Unloaded,
    Loading,
    Ready,
    Resetting,
    Terminated,
}

/// State visible to leases without taking the engine slot lock.
struct Shared {
    state: Mutex<EngineState>,
    generation: AtomicU64,
    active_job: Mutex<Option<String>>,
}

impl Shared {
    fn set_state(&self, state: EngineState) {
        let mut guard = self.state.lock();
        if *guard != state {
            log::debug!(
                target: "budget_vid::engine",
                "Engine state {:?} -> {:?}",
                *guard,
                state
            );
            *guard = state;
        }
    }
}

pub struct EngineLifecycleManager {
    loader: Arc<dyn EngineLoader>,
    slot: tokio::sync::Mutex<Option<Arc<dyn Engine>>>,
    shared: Arc<Shared>,
    processed: AtomicU32,
    resets: AtomicU32,
    timeouts: EngineTimeouts,
    reset_every_jobs: Option<u32>,
}

impl EngineLifecycleManager {
    pub fn new(loader: Arc<dyn EngineLoader>, timeouts: EngineTimeouts) -> Self {
        Self {
            loader,
            slot: tokio::sync::Mutex::new(None),
            shared: Arc::new(Shared {
                state: Mutex::new(EngineState::Unloaded),
                generation: AtomicU64::new(0),
                active_job: Mutex::new(None),
            }),
            processed: AtomicU32::new(0),
            resets: AtomicU32::new(0),
            timeouts,
            reset_every_jobs: None,
        }
    }

    /// Reset (non-forced) after every `n` jobs on one instance.
    pub fn with_periodic_reset(mut self, n: Option<u32>) -> Self {
        self.reset_every_jobs = n.filter(|&n| n > 0);
        self
    }

    pub fn timeouts(&self) -> &EngineTimeouts {
        &self.timeouts
    }

    pub fn state(&self) -> EngineState {
        *self.shared.state.lock()
    }

    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    pub fn active_job(&self) -> Option<String> {
        self.shared.active_job.lock().clone()
    }

    /// Jobs finished on the current instance.
    pub fn processed_jobs(&self) -> u32 {
        self.processed.load(Ordering::SeqCst)
    }

    /// Resets performed since creation (forced or not).
    pub fn reset_count(&self) -> u32 {
        self.resets.load(Ordering::SeqCst)
    }

    /// Loads the engine if needed. Concurrent callers wait for the one in-flight load.
    pub async fn load(&self) -> Result<(), AppError> {
        let mut slot = self.slot.lock().await;
        self.load_locked(&mut slot).await.map(|_| ())
    }

    async fn load_locked(
        &self,
        slot: &mut Option<Arc<dyn Engine>>,
    ) -> Result<Arc<dyn Engine>, AppError> {
        if let Some(engine) = slot.as_ref() {
            return Ok(Arc::clone(engine));
        }
        if self.state() == EngineState::Terminated {
            return Err(AppError::EngineLoad("engine has been shut down".into()));
        }
        self.shared.set_state(EngineState::Loading);
        let loader = Arc::clone(&self.loader);
        let limit = self.timeouts.engine_load;
        let loaded = tokio::time::timeout(limit, tokio::task::spawn_blocking(move || loader.load()))
            .await;
        let result = match loaded {
            Ok(Ok(Ok(engine))) => Ok(engine),
            Ok(Ok(Err(e))) => Err(AppError::EngineLoad(e.to_string())),
            Ok(Err(join_err)) => Err(AppError::EngineLoad(join_err.to_string())),
            Err(_) => Err(AppError::EngineLoad(format!(
                "timed out after {}s",
                limit.as_secs()
            ))),
        };
        match result {
            Ok(engine) => {
                *slot = Some(Arc::clone(&engine));
                self.shared.set_state(EngineState::Ready);
                log::info!(
                    target: "budget_vid::engine",
                    "Engine loaded (generation {})",
                    self.generation()
                );
                Ok(engine)
            }
            Err(e) => {
                self.shared.set_state(EngineState::Unloaded);
                log::error!(target: "budget_vid::engine", "{}", e);
                Err(e)
            }
        }
    }

    /// Tears the instance down and loads a fresh one.
    ///
    /// Non-forced while a job holds a lease: logged no-op. Forced: the active
    /// job's lease is invalidated and its in-flight work is killed.
    pub async fn reset(&self, force: bool) -> Result<(), AppError> {
        // `acquire` marks the active job under the slot lock, so check it here.
        let mut slot = self.slot.lock().await;
        {
            let mut active = self.shared.active_job.lock();
            if let Some(job) = active.as_ref() {
                if !force {
                    log::info!(
                        target: "budget_vid::engine",
                        "Skipping engine reset: job {} is active",
                        job
                    );
                    return Ok(());
                }
                log::warn!(
                    target: "budget_vid::engine",
                    "Forcing engine reset while job {} is active",
                    job
                );
                *active = None;
            }
        }

        if self.state() == EngineState::Terminated {
            return Ok(());
        }
        self.shared.set_state(EngineState::Resetting);
        if let Some(engine) = slot.take() {
            tokio::time::sleep(self.timeouts.pre_terminate_settle).await;
            terminate_blocking(engine).await;
        }
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.processed.store(0, Ordering::SeqCst);
        self.resets.fetch_add(1, Ordering::SeqCst);
        log::info!(
            target: "budget_vid::engine",
            "Engine reset (force={}, generation {})",
            force,
            generation
        );
        tokio::time::sleep(self.timeouts.reclaim_settle).await;
        self.load_locked(&mut slot).await.map(|_| ())
    }

    /// Loads if needed and marks `job_id` as the active job.
    pub async fn acquire(&self, job_id: &str) -> Result<EngineLease, AppError> {
        let mut slot = self.slot.lock().await;
        let engine = self.load_locked(&mut slot).await?;
        let generation = self.generation();
        *self.shared.active_job.lock() = Some(job_id.to_string());
        drop(slot);
        log::debug!(
            target: "budget_vid::engine",
            "Lease for job {} (generation {})",
            job_id,
            generation
        );
        Ok(EngineLease {
            engine,
            generation,
            job_id: job_id.to_string(),
            shared: Arc::clone(&self.shared),
        })
    }

    /// Counts a finished job and performs the periodic reset once it is due.
    /// Call after the job's lease is dropped.
    pub async fn job_finished(&self) -> Result<(), AppError> {
        let processed = self.processed.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(every) = self.reset_every_jobs
            && processed >= every
        {
            log::info!(
                target: "budget_vid::engine",
                "Periodic engine reset after {} jobs",
                processed
            );
            return self.reset(false).await;
        }
        Ok(())
    }

    /// Terminates the instance without reloading.
    pub async fn shutdown(&self) {
        let mut slot = self.slot.lock().await;
        *self.shared.active_job.lock() = None;
        if let Some(engine) = slot.take() {
            terminate_blocking(engine).await;
        }
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.set_state(EngineState::Terminated);
        log::info!(target: "budget_vid::engine", "Engine shut down");
    }
}

async fn terminate_blocking(engine: Arc<dyn Engine>) {
    if let Err(e) = tokio::task::spawn_blocking(move || engine.terminate()).await {
        log::warn!(
            target: "budget_vid::engine",
            "Engine terminate failed: {}",
            e
        );
    }
}

/// A job's handle on the engine. Dropping it clears the active flag unless a
/// reset already invalidated it.
pub struct EngineLease {
    engine: Arc<dyn Engine>,
    generation: u64,
    job_id: String,
    shared: Arc<Shared>,
}

impl EngineLease {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self) -> bool {
        self.shared.generation.load(Ordering::SeqCst) == self.generation
    }

    fn check_current(&self) -> Result<(), AppError> {
        let current = self.shared.generation.load(Ordering::SeqCst);
        if current == self.generation {
            Ok(())
        } else {
            Err(AppError::EngineReset {
                lease: self.generation,
                current,
            })
        }
    }

    /// Runs `op` against the engine on the blocking pool, bounded by `limit`.
    ///
    /// On deadline the engine's in-flight work is aborted and `Timeout` is
    /// returned. An error raised after a reset invalidated this lease is
    /// reported as `EngineReset`.
    pub async fn call<T, F>(&self, operation: &str, limit: Duration, op: F) -> Result<T, AppError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Engine) -> Result<T, AppError> + Send + 'static,
    {
        self.check_current()?;
        let engine = Arc::clone(&self.engine);
        let task = tokio::task::spawn_blocking(move || op(engine.as_ref()));
        let result = match tokio::time::timeout(limit, task).await {
            Ok(Ok(r)) => r,
            Ok(Err(join_err)) => Err(AppError::from(join_err.to_string())),
            Err(_) => {
                log::warn!(
                    target: "budget_vid::engine",
                    "{} for job {} exceeded {:?}; aborting engine work",
                    operation,
                    self.job_id,
                    limit
                );
                self.engine.abort();
                return Err(AppError::timeout(operation, limit));
            }
        };
        match result {
            Err(e) => {
                self.check_current()?;
                Err(e)
            }
            ok => ok,
        }
    }
}

impl Drop for EngineLease {
    fn drop(&mut self) {
        if !self.is_current() {
            return;
        }
        let mut active = self.shared.active_job.lock();
        if active.as_deref() == Some(self.job_id.as_str()) {
            *active = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::test_support::{ScriptedEngineLoader, fast_timeouts};

    fn manager(loader: &Arc<ScriptedEngineLoader>) -> EngineLifecycleManager {
        EngineLifecycleManager::new(loader.clone(), fast_timeouts())
    }

    #[tokio::test]
    async fn load_is_idempotent() {
        let loader = Arc::new(ScriptedEngineLoader::new());
        let m = manager(&loader);
        assert_eq!(m.state(), EngineState::Unloaded);
        m.load().await.unwrap();
        m.load().await.unwrap();
        assert_eq!(m.state(), EngineState::Ready);
        assert_eq!(loader.load_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_loads_share_one_instance() {
        let loader = Arc::new(ScriptedEngineLoader::new());
        let m = Arc::new(manager(&loader));
        let (a, b, c) = tokio::join!(m.load(), m.load(), m.load());
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(loader.load_count(), 1);
    }

    #[tokio::test]
    async fn failed_load_leaves_engine_unloaded_and_next_acquire_retries() {
        let loader = Arc::new(ScriptedEngineLoader::new());
        loader.fail_next_loads(1);
        let m = manager(&loader);
        let err = m.acquire("a").await.err().unwrap();
        assert!(matches!(err, AppError::EngineLoad(_)));
        assert_eq!(m.state(), EngineState::Unloaded);
        assert!(m.active_job().is_none());
        let _lease = m.acquire("a").await.unwrap();
        assert_eq!(m.state(), EngineState::Ready);
        assert_eq!(loader.load_count(), 2);
    }

    #[tokio::test]
    async fn unforced_reset_is_noop_while_job_active() {
        let loader = Arc::new(ScriptedEngineLoader::new());
        let m = manager(&loader);
        let lease = m.acquire("job-1").await.unwrap();
        m.reset(false).await.unwrap();
        assert_eq!(loader.termination_count(), 0);
        assert_eq!(m.generation(), 0);
        assert!(lease.is_current());
        drop(lease);
        assert!(m.active_job().is_none());
        m.reset(false).await.unwrap();
        assert_eq!(loader.termination_count(), 1);
        assert_eq!(loader.load_count(), 2);
        assert_eq!(m.generation(), 1);
        assert_eq!(m.state(), EngineState::Ready);
    }

    #[tokio::test]
    async fn unforced_reset_rechecks_job_acquired_while_waiting_for_slot() {
        let loader = Arc::new(ScriptedEngineLoader::new());
        let m = Arc::new(manager(&loader));
        m.load().await.unwrap();
        let slot = m.slot.lock().await;
        let pending = tokio::spawn({
            let m = Arc::clone(&m);
            async move { m.reset(false).await }
        });
        tokio::task::yield_now().await;
        *m.shared.active_job.lock() = Some("job-2".to_string());
        drop(slot);
        pending.await.unwrap().unwrap();
        assert_eq!(loader.termination_count(), 0);
        assert_eq!(m.generation(), 0);
        assert_eq!(m.active_job().as_deref(), Some("job-2"));
    }

    #[tokio::test]
    async fn forced_reset_invalidates_lease() {
        let loader = Arc::new(ScriptedEngineLoader::new());
        let m = manager(&loader);
        let lease = m.acquire("job-1").await.unwrap();
        m.reset(true).await.unwrap();
        assert!(!lease.is_current());
        assert!(m.active_job().is_none());
        let err = lease
            .call("Write input", Duration::from_secs(1), |e| e.write_file("x", b"1"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::EngineReset { lease: 0, current: 1 }));
    }

    #[tokio::test]
    async fn stale_lease_drop_does_not_clear_new_job() {
        let loader = Arc::new(ScriptedEngineLoader::new());
        let m = manager(&loader);
        let old = m.acquire("job-1").await.unwrap();
        m.reset(true).await.unwrap();
        let _new = m.acquire("job-2").await.unwrap();
        drop(old);
        assert_eq!(m.active_job().as_deref(), Some("job-2"));
    }

    #[tokio::test]
    async fn call_deadline_aborts_engine_work() {
        let loader = Arc::new(ScriptedEngineLoader::new());
        loader.script().push_hang();
        let m = manager(&loader);
        let lease = m.acquire("job-1").await.unwrap();
        lease
            .call("Write input", Duration::from_secs(1), |e| e.write_file("in.mp4", b"src"))
            .await
            .unwrap();
        let args = vec!["-i".to_string(), "in.mp4".to_string(), "out.mp4".to_string()];
        let err = lease
            .call("Encode", Duration::from_millis(50), move |e| {
                e.exec(&args, None, None)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Timeout { .. }));
        assert_eq!(loader.script().abort_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn periodic_reset_after_n_jobs() {
        let loader = Arc::new(ScriptedEngineLoader::new());
        let m = manager(&loader).with_periodic_reset(Some(2));
        for job in ["a", "b", "c"] {
            drop(m.acquire(job).await.unwrap());
            m.job_finished().await.unwrap();
        }
        assert_eq!(m.reset_count(), 1);
        assert_eq!(m.processed_jobs(), 1);
    }

    #[tokio::test]
    async fn shutdown_is_terminal() {
        let loader = Arc::new(ScriptedEngineLoader::new());
        let m = manager(&loader);
        m.load().await.unwrap();
        m.shutdown().await;
        assert_eq!(m.state(), EngineState::Terminated);
        assert_eq!(loader.termination_count(), 1);
        assert!(matches!(m.acquire("x").await, Err(AppError::EngineLoad(_))));
    }
}
