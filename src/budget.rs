//! Encode-to-budget: derive a video bitrate from a byte budget, encode, measure,
//! and shrink the budget once if the output is over the hard ceiling.

use std::time::Duration;

use serde::Serialize;

use crate::config::{EngineTimeouts, OptimizationConfig};
use crate::engine::EngineLease;
use crate::error::AppError;
use crate::ffmpeg::{ProgressCallback, build_transcode_args, format_args_for_display_multiline};

pub const MAX_ATTEMPTS: u32 = 2;
/// Budget multiplier applied before each retry.
pub const SHRINK_FACTOR: f64 = 0.7;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodeAttempt {
    pub attempt_index: u32,
    pub candidate_target_size_bytes: f64,
    pub candidate_video_bitrate_bps: u64,
    pub produced_size_bytes: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct EncodeOutcome {
    pub bytes: Vec<u8>,
    pub video_bitrate_bps: u64,
    /// `video_bitrate_bps / 1024`, floored.
    pub bitrate_kbps: u64,
    pub attempts: Vec<EncodeAttempt>,
    /// Every attempt came out above `max_limit_bytes`; `bytes` is the last one.
    pub size_budget_exceeded: bool,
}

/// Bitrate for one attempt: `max(target * 8 / duration - audio, min_video)`, floored.
pub fn plan_attempt(
    attempt_index: u32,
    current_target_bytes: f64,
    duration_secs: f64,
    config: &OptimizationConfig,
) -> EncodeAttempt {
    let total_bps = current_target_bytes * 8.0 / duration_secs;
    let video_bps = (total_bps - config.audio_bitrate_bps as f64)
        .max(config.min_video_bitrate_bps as f64)
        .floor();
    EncodeAttempt {
        attempt_index,
        candidate_target_size_bytes: current_target_bytes,
        candidate_video_bitrate_bps: video_bps as u64,
        produced_size_bytes: None,
    }
}

pub fn validate_duration(duration_secs: f64) -> Result<(), AppError> {
    if duration_secs.is_finite() && duration_secs > 0.0 {
        Ok(())
    } else {
        Err(AppError::input(format!(
            "Invalid video duration: {duration_secs}"
        )))
    }
}

/// Names of the engine files one encode works on.
#[derive(Debug, Clone)]
pub struct EncodeFiles {
    pub input: String,
    pub output: String,
}

/// Encodes `files.input` into `files.output` until it fits `max_limit_bytes`
/// or [`MAX_ATTEMPTS`] are used. Timeouts fail the encode; they are not retried here.
pub async fn encode_to_budget(
    lease: &EngineLease,
    files: &EncodeFiles,
    duration_secs: f64,
    config: &OptimizationConfig,
    timeouts: &EngineTimeouts,
    progress: Option<ProgressCallback>,
) -> Result<EncodeOutcome, AppError> {
    validate_duration(duration_secs)?;

    let encode_limit = timeouts.encode_timeout(duration_secs);
    let read_limit = timeouts.read_output_timeout(duration_secs);
    let mut current_target_bytes = config.target_size_bytes as f64;
    let mut attempts: Vec<EncodeAttempt> = Vec::new();

    for index in 0..MAX_ATTEMPTS {
        let mut attempt = plan_attempt(index, current_target_bytes, duration_secs, config);
        log::info!(
            target: "budget_vid::budget",
            "Attempt {}: target={:.0} bytes, video={} bps",
            index,
            attempt.candidate_target_size_bytes,
            attempt.candidate_video_bitrate_bps
        );

        remove_stale_output(lease, &files.output, timeouts.cleanup).await;

        let args = build_transcode_args(
            &files.input,
            &files.output,
            attempt.candidate_video_bitrate_bps,
            config.audio_bitrate_bps,
            config.target_width_px,
        );
        log::debug!(
            target: "budget_vid::budget",
            "FFmpeg args:\n{}",
            format_args_for_display_multiline(&args)
        );
        let cb = progress.clone();
        lease
            .call("Encode", encode_limit, move |engine| {
                engine.exec(&args, Some(duration_secs), cb)
            })
            .await?;

        let output = files.output.clone();
        let bytes = lease
            .call("Read output", read_limit, move |engine| {
                engine.read_file(&output)
            })
            .await?;
        let size = bytes.len() as u64;
        attempt.produced_size_bytes = Some(size);
        let video_bitrate_bps = attempt.candidate_video_bitrate_bps;
        attempts.push(attempt);

        let fits = size <= config.max_limit_bytes;
        let last = index + 1 == MAX_ATTEMPTS;
        if fits || last {
            if !fits {
                log::warn!(
                    target: "budget_vid::budget",
                    "Output {} bytes still above limit {} after {} attempts",
                    size,
                    config.max_limit_bytes,
                    MAX_ATTEMPTS
                );
            }
            return Ok(EncodeOutcome {
                bytes,
                video_bitrate_bps,
                bitrate_kbps: video_bitrate_bps / 1024,
                attempts,
                size_budget_exceeded: !fits,
            });
        }

        log::info!(
            target: "budget_vid::budget",
            "Output {} bytes over limit {}; shrinking budget",
            size,
            config.max_limit_bytes
        );
        current_target_bytes *= SHRINK_FACTOR;
    }

    Err(AppError::from("Encoding produced no result"))
}

async fn remove_stale_output(lease: &EngineLease, name: &str, limit: Duration) {
    let name = name.to_string();
    if let Err(e) = lease
        .call("Delete stale output", limit, move |engine| {
            engine.delete_file(&name)
        })
        .await
    {
        log::debug!(
            target: "budget_vid::budget",
            "Stale output cleanup failed: {}",
            e
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::engine::EngineLifecycleManager;
    use crate::test_support::{ScriptedEngineLoader, fast_timeouts};

    const MB: usize = 1024 * 1024;

    fn scenario_config() -> OptimizationConfig {
        OptimizationConfig {
            target_size_bytes: 1_572_864,
            max_limit_bytes: 2_097_152,
            audio_bitrate_bps: 128_000,
            min_video_bitrate_bps: 300_000,
            ..Default::default()
        }
    }

    fn files() -> EncodeFiles {
        EncodeFiles {
            input: "input_1.mp4".into(),
            output: "output_1.mp4".into(),
        }
    }

    async fn leased(loader: &Arc<ScriptedEngineLoader>) -> (EngineLifecycleManager, EngineLease) {
        let m = EngineLifecycleManager::new(loader.clone(), fast_timeouts());
        let lease = m.acquire("job").await.unwrap();
        lease
            .call("Write input", Duration::from_secs(1), |e| {
                e.write_file("input_1.mp4", b"src")
            })
            .await
            .unwrap();
        (m, lease)
    }

    #[test]
    fn first_attempt_bitrate_formula() {
        let a = plan_attempt(0, 1_572_864.0, 10.0, &scenario_config());
        assert_eq!(a.candidate_video_bitrate_bps, 1_130_291);
    }

    #[test]
    fn bitrate_never_below_minimum() {
        let a = plan_attempt(0, 100_000.0, 60.0, &scenario_config());
        assert_eq!(a.candidate_video_bitrate_bps, 300_000);
    }

    #[test]
    fn bad_durations_are_input_errors() {
        for d in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(validate_duration(d), Err(AppError::Input(_))));
        }
    }

    #[tokio::test]
    async fn fits_on_first_attempt() {
        let loader = Arc::new(ScriptedEngineLoader::new());
        loader.script().push_output(MB);
        let (_m, lease) = leased(&loader).await;
        let out = encode_to_budget(&lease, &files(), 10.0, &scenario_config(), &fast_timeouts(), None)
            .await
            .unwrap();
        assert_eq!(out.attempts.len(), 1);
        assert!(!out.size_budget_exceeded);
        assert_eq!(out.bytes.len(), MB);
        assert_eq!(out.video_bitrate_bps, 1_130_291);
        assert_eq!(out.bitrate_kbps, 1_103);
    }

    #[tokio::test]
    async fn over_limit_shrinks_budget_once_then_flags() {
        let loader = Arc::new(ScriptedEngineLoader::new());
        loader.script().push_output(2_411_724);
        loader.script().push_output(2_200_000);
        let (_m, lease) = leased(&loader).await;
        let out = encode_to_budget(&lease, &files(), 10.0, &scenario_config(), &fast_timeouts(), None)
            .await
            .unwrap();
        assert_eq!(out.attempts.len(), 2);
        assert!(out.size_budget_exceeded);
        assert_eq!(out.bytes.len(), 2_200_000);
        let second = &out.attempts[1];
        assert!((second.candidate_target_size_bytes - 1_572_864.0 * 0.7).abs() < 1e-6);
        assert!(second.candidate_target_size_bytes < out.attempts[0].candidate_target_size_bytes);
        assert_eq!(loader.script().transcode_count(), 2);
        assert_eq!(
            loader.script().video_bitrates(),
            vec![1_130_291, 752_803]
        );
    }

    #[tokio::test]
    async fn second_attempt_within_limit_succeeds() {
        let loader = Arc::new(ScriptedEngineLoader::new());
        loader.script().push_output(3 * MB);
        loader.script().push_output(MB);
        let (_m, lease) = leased(&loader).await;
        let out = encode_to_budget(&lease, &files(), 10.0, &scenario_config(), &fast_timeouts(), None)
            .await
            .unwrap();
        assert!(!out.size_budget_exceeded);
        assert_eq!(out.attempts[1].produced_size_bytes, Some(MB as u64));
    }

    #[tokio::test]
    async fn memory_fault_propagates_without_retry() {
        let loader = Arc::new(ScriptedEngineLoader::new());
        loader.script().push_memory_fault();
        let (_m, lease) = leased(&loader).await;
        let err = encode_to_budget(&lease, &files(), 10.0, &scenario_config(), &fast_timeouts(), None)
            .await
            .unwrap_err();
        assert!(err.is_memory_fault());
        assert_eq!(loader.script().transcode_count(), 1);
    }

    #[tokio::test]
    async fn encode_timeout_is_a_job_failure() {
        let loader = Arc::new(ScriptedEngineLoader::new());
        loader.script().push_hang();
        let (_m, lease) = leased(&loader).await;
        let timeouts = EngineTimeouts {
            encode_base: Duration::from_millis(30),
            encode_per_minute: Duration::ZERO,
            ..fast_timeouts()
        };
        let err = encode_to_budget(&lease, &files(), 10.0, &scenario_config(), &timeouts, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Timeout { .. }));
        assert_eq!(loader.script().transcode_count(), 1);
    }

    #[tokio::test]
    async fn progress_reaches_callback() {
        let loader = Arc::new(ScriptedEngineLoader::new());
        let (_m, lease) = leased(&loader).await;
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: ProgressCallback = Arc::new(move |p| sink.lock().push(p));
        encode_to_budget(&lease, &files(), 10.0, &scenario_config(), &fast_timeouts(), Some(cb))
            .await
            .unwrap();
        assert_eq!(*seen.lock(), vec![0.5, 1.0]);
    }

    #[tokio::test]
    async fn zero_duration_fails_before_any_attempt() {
        let loader = Arc::new(ScriptedEngineLoader::new());
        let (_m, lease) = leased(&loader).await;
        let err = encode_to_budget(&lease, &files(), 0.0, &scenario_config(), &fast_timeouts(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Input(_)));
        assert_eq!(loader.script().transcode_count(), 0);
    }
}
