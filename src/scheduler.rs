//! Wave scheduling: jobs run strictly one after another in fixed-size waves,
//! with a non-forced engine reset between waves to keep memory flat.

use std::future::Future;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

use crate::engine::EngineLifecycleManager;

/// Contiguous index ranges of at most `wave_size` jobs. `wave_size` 0 is treated as 1.
pub fn plan_waves(job_count: usize, wave_size: usize) -> Vec<Range<usize>> {
    let size = wave_size.max(1);
    (0..job_count)
        .step_by(size)
        .map(|start| start..(start + size).min(job_count))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaveReport {
    pub waves: usize,
    pub jobs: usize,
}

pub struct WaveScheduler {
    engine: Arc<EngineLifecycleManager>,
    wave_size: usize,
    current_wave: AtomicUsize,
    total_waves: AtomicUsize,
}

impl WaveScheduler {
    pub fn new(engine: Arc<EngineLifecycleManager>, wave_size: usize) -> Self {
        Self {
            engine,
            wave_size: wave_size.max(1),
            current_wave: AtomicUsize::new(0),
            total_waves: AtomicUsize::new(0),
        }
    }

    pub fn wave_size(&self) -> usize {
        self.wave_size
    }

    /// 1-based index of the running wave; 0 when idle.
    pub fn current_wave(&self) -> usize {
        self.current_wave.load(Ordering::SeqCst)
    }

    pub fn total_waves(&self) -> usize {
        self.total_waves.load(Ordering::SeqCst)
    }

    /// Runs every job through `run`, one at a time. `run` records its own
    /// failures; the schedule never stops early. Between waves (not after the
    /// last) the engine is reset without force; a failed reset is logged.
    pub async fn run_waves<T, F, Fut>(
        &self,
        jobs: Vec<T>,
        mut run: F,
        on_wave_start: impl Fn(usize, usize),
    ) -> WaveReport
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = ()>,
    {
        let job_count = jobs.len();
        let waves = plan_waves(job_count, self.wave_size);
        let total = waves.len();
        self.total_waves.store(total, Ordering::SeqCst);
        log::info!(
            target: "budget_vid::scheduler",
            "Processing {} jobs in {} waves of up to {}",
            job_count,
            total,
            self.wave_size
        );

        let mut remaining = jobs.into_iter();
        for (i, range) in waves.iter().enumerate() {
            let wave = i + 1;
            self.current_wave.store(wave, Ordering::SeqCst);
            on_wave_start(wave, total);
            log::info!(
                target: "budget_vid::scheduler",
                "Wave {}/{}: {} jobs",
                wave,
                total,
                range.len()
            );
            for job in remaining.by_ref().take(range.len()) {
                run(job).await;
            }
            if wave < total
                && let Err(e) = self.engine.reset(false).await
            {
                log::error!(
                    target: "budget_vid::scheduler",
                    "Engine reset after wave {} failed: {}",
                    wave,
                    e
                );
            }
        }

        self.current_wave.store(0, Ordering::SeqCst);
        WaveReport {
            waves: total,
            jobs: job_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::test_support::{ScriptedEngineLoader, fast_timeouts};

    fn scheduler(loader: &Arc<ScriptedEngineLoader>, wave_size: usize) -> WaveScheduler {
        let engine = Arc::new(EngineLifecycleManager::new(loader.clone(), fast_timeouts()));
        WaveScheduler::new(engine, wave_size)
    }

    #[test]
    fn waves_are_contiguous_and_bounded() {
        assert_eq!(plan_waves(12, 5), vec![0..5, 5..10, 10..12]);
        assert_eq!(plan_waves(5, 5), vec![0..5]);
        assert!(plan_waves(0, 5).is_empty());
        assert_eq!(plan_waves(3, 0).len(), 3);
    }

    #[test]
    fn wave_count_is_ceiling() {
        for n in 0..30 {
            for w in 1..8 {
                assert_eq!(plan_waves(n, w).len(), n.div_ceil(w), "n={n} w={w}");
            }
        }
    }

    #[tokio::test]
    async fn twelve_jobs_reset_twice() {
        let loader = Arc::new(ScriptedEngineLoader::new());
        let s = scheduler(&loader, 5);
        let order = Mutex::new(Vec::new());
        let starts = Mutex::new(Vec::new());
        let report = s
            .run_waves(
                (0..12).collect(),
                |i: usize| {
                    order.lock().push(i);
                    async {}
                },
                |wave, total| starts.lock().push((wave, total)),
            )
            .await;
        assert_eq!(report.waves, 3);
        assert_eq!(*order.lock(), (0..12).collect::<Vec<_>>());
        assert_eq!(*starts.lock(), vec![(1, 3), (2, 3), (3, 3)]);
        assert_eq!(s.engine.reset_count(), 2);
        assert_eq!(s.current_wave(), 0);
        assert_eq!(s.total_waves(), 3);
    }

    #[tokio::test]
    async fn single_wave_never_resets() {
        let loader = Arc::new(ScriptedEngineLoader::new());
        let s = scheduler(&loader, 5);
        s.run_waves(vec![1, 2, 3], |_| async {}, |_, _| {}).await;
        assert_eq!(s.engine.reset_count(), 0);
        assert_eq!(loader.load_count(), 0);
    }

    #[tokio::test]
    async fn failed_reset_does_not_stop_the_run() {
        let loader = Arc::new(ScriptedEngineLoader::new());
        loader.fail_next_loads(5);
        let s = scheduler(&loader, 1);
        let ran = Mutex::new(0);
        let report = s
            .run_waves(
                vec![(); 3],
                |_| {
                    *ran.lock() += 1;
                    async {}
                },
                |_, _| {},
            )
            .await;
        assert_eq!(report.waves, 3);
        assert_eq!(*ran.lock(), 3);
    }
}
