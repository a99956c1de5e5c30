//! Thumbnail timestamp selection that steps past near-black frames.
//!
//! Three bases (near start, middle, near end) are each searched forward in
//! half-second steps for the first frame brighter than the threshold. A search
//! that fails, times out or finds nothing keeps its base.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::brightness::{PROBE_WIDTH_PX, SAMPLE_STEP, average_luma};
use crate::engine::MediaInspector;
use crate::error::AppError;
use crate::ffmpeg::FrameWidth;

/// Frames at or below this mean luma count as black.
pub const DEFAULT_BRIGHTNESS_THRESHOLD: f64 = 30.0;
const SEARCH_STEP_SECS: f64 = 0.5;
const SEARCH_WINDOW_SECS: f64 = 5.0;
const MAX_SEARCH_SECS: f64 = 10.0;

/// Brightness of the frame at a timestamp. Blocking.
pub trait BrightnessProbe: Send + Sync {
    fn brightness_at(&self, timestamp_secs: f64) -> Result<f64, AppError>;
}

impl<F> BrightnessProbe for F
where
    F: Fn(f64) -> Result<f64, AppError> + Send + Sync,
{
    fn brightness_at(&self, timestamp_secs: f64) -> Result<f64, AppError> {
        self(timestamp_secs)
    }
}

/// Decodes probe frames of one source through a [`MediaInspector`].
pub struct InspectorProbe {
    inspector: Arc<dyn MediaInspector>,
    source: PathBuf,
}

impl InspectorProbe {
    pub fn new(inspector: Arc<dyn MediaInspector>, source: PathBuf) -> Self {
        Self { inspector, source }
    }
}

impl BrightnessProbe for InspectorProbe {
    fn brightness_at(&self, timestamp_secs: f64) -> Result<f64, AppError> {
        let frame = self.inspector.decode_frame(
            &self.source,
            timestamp_secs,
            FrameWidth::AtMost(PROBE_WIDTH_PX),
        )?;
        Ok(average_luma(&frame, SAMPLE_STEP))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThumbnailCandidate {
    pub timestamp_seconds: f64,
    pub brightness_score: f64,
    pub is_acceptable: bool,
}

/// `[min(offset, 0.1d), 0.5d, 0.85d]`.
pub fn base_timestamps(duration: f64, offset_seconds: f64) -> [f64; 3] {
    [
        offset_seconds.min(duration * 0.1).max(0.0),
        duration * 0.5,
        duration * 0.85,
    ]
}

/// First acceptable frame in `[base, min(base + 5, duration, base + 10))`, else `base`.
///
/// Stops at the next sample once `cancel` is set.
pub fn search_from(
    base: f64,
    duration: f64,
    threshold: f64,
    probe: &dyn BrightnessProbe,
    cancel: &AtomicBool,
) -> f64 {
    let end = (base + SEARCH_WINDOW_SECS)
        .min(duration)
        .min(base + MAX_SEARCH_SECS);
    let mut step = 0u32;
    loop {
        let t = base + f64::from(step) * SEARCH_STEP_SECS;
        if t >= end || cancel.load(Ordering::Relaxed) {
            return base;
        }
        let candidate = match probe.brightness_at(t) {
            Ok(score) => ThumbnailCandidate {
                timestamp_seconds: t,
                brightness_score: score,
                is_acceptable: score > threshold,
            },
            Err(e) => {
                log::debug!(
                    target: "budget_vid::thumbnail",
                    "Brightness probe at {:.2}s failed: {}",
                    t,
                    e
                );
                return base;
            }
        };
        log::trace!(target: "budget_vid::thumbnail", "{:?}", candidate);
        if candidate.is_acceptable {
            return candidate.timestamp_seconds;
        }
        step += 1;
    }
}

/// Three timestamps within `[0, duration]`. Never fails.
///
/// The searches run concurrently on the blocking pool, each bounded by `limit`.
pub async fn select_timestamps(
    probe: Arc<dyn BrightnessProbe>,
    duration: f64,
    offset_seconds: f64,
    threshold: f64,
    limit: Duration,
) -> [f64; 3] {
    let duration = if duration.is_finite() {
        duration.max(0.0)
    } else {
        0.0
    };
    let [b0, b1, b2] = base_timestamps(duration, offset_seconds);
    let (t0, t1, t2) = tokio::join!(
        bounded_search(Arc::clone(&probe), b0, duration, threshold, limit),
        bounded_search(Arc::clone(&probe), b1, duration, threshold, limit),
        bounded_search(probe, b2, duration, threshold, limit),
    );
    log::debug!(
        target: "budget_vid::thumbnail",
        "Thumbnail timestamps: bases=[{:.2}, {:.2}, {:.2}] selected=[{:.2}, {:.2}, {:.2}]",
        b0,
        b1,
        b2,
        t0,
        t1,
        t2
    );
    [t0, t1, t2]
}

async fn bounded_search(
    probe: Arc<dyn BrightnessProbe>,
    base: f64,
    duration: f64,
    threshold: f64,
    limit: Duration,
) -> f64 {
    let cancel = Arc::new(AtomicBool::new(false));
    let task_cancel = Arc::clone(&cancel);
    let task = tokio::task::spawn_blocking(move || {
        search_from(base, duration, threshold, probe.as_ref(), &task_cancel)
    });
    let selected = match tokio::time::timeout(limit, task).await {
        Ok(Ok(t)) => t,
        Ok(Err(e)) => {
            log::warn!(target: "budget_vid::thumbnail", "Frame search failed: {}", e);
            base
        }
        Err(_) => {
            cancel.store(true, Ordering::Relaxed);
            log::warn!(
                target: "budget_vid::thumbnail",
                "Frame search from {:.2}s timed out after {:?}; using base",
                base,
                limit
            );
            base
        }
    };
    selected.clamp(0.0, duration)
}
