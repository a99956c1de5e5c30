//! Job, engine and scheduler settings. JSON keys are camelCase; missing keys take defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

const MIB: u64 = 1024 * 1024;

/// Source extensions accepted at submit time (compared case-insensitively).
pub const ALLOWED_EXTENSIONS: [&str; 4] = ["mp4", "mov", "avi", "m4v"];

/// Thumbnail crop aspect ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AspectRatio {
    #[serde(rename = "16:9")]
    Landscape16x9,
    #[serde(rename = "1:1")]
    Square,
    #[serde(rename = "9:16")]
    Portrait9x16,
    #[default]
    #[serde(rename = "original")]
    Original,
}

impl AspectRatio {
    /// Width / height, or `None` to keep the source aspect.
    pub fn ratio(self) -> Option<f64> {
        match self {
            AspectRatio::Landscape16x9 => Some(16.0 / 9.0),
            AspectRatio::Square => Some(1.0),
            AspectRatio::Portrait9x16 => Some(9.0 / 16.0),
            AspectRatio::Original => None,
        }
    }
}

/// Per-job settings. Shared read-only once a job is dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OptimizationConfig {
    pub target_size_bytes: u64,
    /// Hard ceiling for the encoded output.
    pub max_limit_bytes: u64,
    pub audio_bitrate_bps: u64,
    pub min_video_bitrate_bps: u64,
    pub target_width_px: u32,
    pub thumbnail_width_px: u32,
    pub thumbnail_offset_seconds: f64,
    /// Advisory only; larger thumbnails are logged, never rejected.
    pub thumbnail_target_size_bytes: u64,
    pub thumbnail_aspect_ratio: AspectRatio,
    pub thumbnail_face_detection: bool,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            target_size_bytes: MIB * 3 / 2,
            max_limit_bytes: MIB * 2,
            audio_bitrate_bps: 128 * 1024,
            min_video_bitrate_bps: 300 * 1024,
            target_width_px: 720,
            thumbnail_width_px: 1000,
            thumbnail_offset_seconds: 1.0,
            thumbnail_target_size_bytes: 100 * 1024,
            thumbnail_aspect_ratio: AspectRatio::Original,
            thumbnail_face_detection: false,
        }
    }
}

impl OptimizationConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        let positive = [
            ("targetSizeBytes", self.target_size_bytes),
            ("maxLimitBytes", self.max_limit_bytes),
            ("audioBitrateBps", self.audio_bitrate_bps),
            ("minVideoBitrateBps", self.min_video_bitrate_bps),
            ("targetWidthPx", u64::from(self.target_width_px)),
            ("thumbnailWidthPx", u64::from(self.thumbnail_width_px)),
            ("thumbnailTargetSizeBytes", self.thumbnail_target_size_bytes),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(AppError::input(format!("{name} must be greater than 0")));
        }
        if !(self.thumbnail_offset_seconds.is_finite() && self.thumbnail_offset_seconds > 0.0) {
            return Err(AppError::input("thumbnailOffsetSeconds must be greater than 0"));
        }
        if self.target_size_bytes > self.max_limit_bytes {
            return Err(AppError::input(format!(
                "targetSizeBytes ({}) exceeds maxLimitBytes ({})",
                self.target_size_bytes, self.max_limit_bytes
            )));
        }
        Ok(())
    }
}

/// Checks the source extension against [`ALLOWED_EXTENSIONS`].
pub fn validate_source_extension(path: &Path) -> Result<(), AppError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
        Ok(())
    } else {
        Err(AppError::input(format!(
            "Unsupported file type: {} (allowed: {})",
            path.display(),
            ALLOWED_EXTENSIONS.join(", ")
        )))
    }
}

/// Deadlines and settle intervals for engine work. Durations are in milliseconds on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineTimeouts {
    #[serde(with = "millis")]
    pub encode_base: Duration,
    /// Added per minute of source duration.
    #[serde(with = "millis")]
    pub encode_per_minute: Duration,
    /// Copying the source into the engine: per MiB of source, clamped to min/max.
    #[serde(with = "millis")]
    pub write_input_per_mib: Duration,
    #[serde(with = "millis")]
    pub write_input_min: Duration,
    #[serde(with = "millis")]
    pub write_input_max: Duration,
    #[serde(with = "millis")]
    pub read_output: Duration,
    /// Duration probe: base plus per MiB of source, capped at max.
    #[serde(with = "millis")]
    pub metadata_base: Duration,
    #[serde(with = "millis")]
    pub metadata_per_mib: Duration,
    #[serde(with = "millis")]
    pub metadata_max: Duration,
    #[serde(with = "millis")]
    pub thumbnail_search: Duration,
    #[serde(with = "millis")]
    pub thumbnail_capture: Duration,
    #[serde(with = "millis")]
    pub face_model_load: Duration,
    #[serde(with = "millis")]
    pub engine_load: Duration,
    #[serde(with = "millis")]
    pub pre_terminate_settle: Duration,
    #[serde(with = "millis")]
    pub reclaim_settle: Duration,
    #[serde(with = "millis")]
    pub cleanup: Duration,
}

impl Default for EngineTimeouts {
    fn default() -> Self {
        Self {
            encode_base: Duration::from_secs(60),
            encode_per_minute: Duration::from_secs(120),
            write_input_per_mib: Duration::from_secs(10),
            write_input_min: Duration::from_secs(20),
            write_input_max: Duration::from_secs(120),
            read_output: Duration::from_secs(15),
            metadata_base: Duration::from_secs(30),
            metadata_per_mib: Duration::from_secs(2),
            metadata_max: Duration::from_secs(120),
            thumbnail_search: Duration::from_secs(15),
            thumbnail_capture: Duration::from_secs(15),
            face_model_load: Duration::from_secs(15),
            engine_load: Duration::from_secs(60),
            pre_terminate_settle: Duration::from_millis(200),
            reclaim_settle: Duration::from_secs(1),
            cleanup: Duration::from_secs(5),
        }
    }
}

impl EngineTimeouts {
    /// `encode_base + (duration / 60) * encode_per_minute`.
    pub fn encode_timeout(&self, duration_secs: f64) -> Duration {
        let minutes = if duration_secs.is_finite() {
            duration_secs.max(0.0) / 60.0
        } else {
            0.0
        };
        self.encode_base
            .saturating_add(scale_saturating(self.encode_per_minute, minutes))
    }

    /// Reading the output never waits longer than the encode itself was allowed.
    pub fn read_output_timeout(&self, duration_secs: f64) -> Duration {
        self.read_output.min(self.encode_timeout(duration_secs))
    }

    pub fn write_input_timeout(&self, source_bytes: u64) -> Duration {
        let mib = source_bytes as f64 / MIB as f64;
        scale_saturating(self.write_input_per_mib, mib)
            .clamp(self.write_input_min, self.write_input_max.max(self.write_input_min))
    }

    pub fn metadata_timeout(&self, source_bytes: u64) -> Duration {
        let mib = source_bytes as f64 / MIB as f64;
        self.metadata_base
            .saturating_add(scale_saturating(self.metadata_per_mib, mib))
            .min(self.metadata_max.max(self.metadata_base))
    }

    /// Zero settle intervals; for tests and fakes that have nothing to reclaim.
    pub fn without_settle(mut self) -> Self {
        self.pre_terminate_settle = Duration::ZERO;
        self.reclaim_settle = Duration::ZERO;
        self
    }
}

/// `Duration::mul_f64` without the overflow panic. Huge probed durations
/// saturate to `Duration::MAX`.
fn scale_saturating(d: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(d.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerSettings {
    pub wave_size: usize,
    /// Non-forced reset once this many jobs ran on one engine instance. Off when `None`.
    pub reset_every_jobs: Option<u32>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            wave_size: 5,
            reset_every_jobs: None,
        }
    }
}

/// Sidecar settings file: every section and key is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub optimization: OptimizationConfig,
    pub timeouts: EngineTimeouts,
    pub scheduler: SchedulerSettings,
}

impl Settings {
    pub fn from_json_str(json: &str) -> Result<Self, AppError> {
        let settings: Settings = serde_json::from_str(json)
            .map_err(|e| AppError::input(format!("Invalid settings: {}", e)))?;
        settings.optimization.validate()?;
        if settings.scheduler.wave_size == 0 {
            return Err(AppError::input("waveSize must be greater than 0"));
        }
        Ok(settings)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, AppError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis().try_into().unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_product_settings() {
        let c = OptimizationConfig::default();
        assert_eq!(c.target_size_bytes, 1_572_864);
        assert_eq!(c.max_limit_bytes, 2_097_152);
        assert_eq!(c.audio_bitrate_bps, 131_072);
        assert_eq!(c.min_video_bitrate_bps, 307_200);
        assert_eq!(c.thumbnail_target_size_bytes, 102_400);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let c: OptimizationConfig =
            serde_json::from_str(r#"{"targetWidthPx": 480, "thumbnailAspectRatio": "9:16"}"#)
                .unwrap();
        assert_eq!(c.target_width_px, 480);
        assert_eq!(c.thumbnail_aspect_ratio, AspectRatio::Portrait9x16);
        assert_eq!(c.max_limit_bytes, 2_097_152);
    }

    #[test]
    fn target_above_limit_is_rejected() {
        let c = OptimizationConfig {
            target_size_bytes: 3 * MIB,
            ..Default::default()
        };
        assert!(matches!(c.validate(), Err(AppError::Input(_))));
    }

    #[test]
    fn zero_field_is_rejected_by_name() {
        let c = OptimizationConfig {
            min_video_bitrate_bps: 0,
            ..Default::default()
        };
        let err = c.validate().unwrap_err();
        assert!(err.to_string().contains("minVideoBitrateBps"));
    }

    #[test]
    fn aspect_ratios() {
        assert_eq!(AspectRatio::Square.ratio(), Some(1.0));
        assert_eq!(AspectRatio::Original.ratio(), None);
        assert!((AspectRatio::Landscape16x9.ratio().unwrap() - 1.777_777).abs() < 1e-5);
    }

    #[test]
    fn encode_timeout_scales_with_duration() {
        let t = EngineTimeouts::default();
        assert_eq!(t.encode_timeout(0.0), Duration::from_secs(60));
        assert_eq!(t.encode_timeout(30.0), Duration::from_secs(120));
        assert_eq!(t.encode_timeout(90.0), Duration::from_secs(240));
        assert_eq!(t.read_output_timeout(30.0), Duration::from_secs(15));
    }

    #[test]
    fn absurd_probed_duration_saturates_instead_of_panicking() {
        let t = EngineTimeouts::default();
        assert_eq!(t.encode_timeout(1.0e20), Duration::MAX);
        assert_eq!(t.encode_timeout(f64::MAX), Duration::MAX);
        assert_eq!(t.read_output_timeout(1.0e20), Duration::from_secs(15));
    }

    #[test]
    fn size_scaled_timeouts_are_clamped() {
        let t = EngineTimeouts::default();
        assert_eq!(t.write_input_timeout(0), Duration::from_secs(20));
        assert_eq!(t.write_input_timeout(5 * MIB), Duration::from_secs(50));
        assert_eq!(t.write_input_timeout(500 * MIB), Duration::from_secs(120));
        assert_eq!(t.metadata_timeout(0), Duration::from_secs(30));
        assert_eq!(t.metadata_timeout(10 * MIB), Duration::from_secs(50));
        assert_eq!(t.metadata_timeout(100 * MIB), Duration::from_secs(120));
    }

    #[test]
    fn settings_file_overrides_nested_keys() {
        let s = Settings::from_json_str(
            r#"{"scheduler": {"waveSize": 3}, "timeouts": {"reclaimSettle": 0}}"#,
        )
        .unwrap();
        assert_eq!(s.scheduler.wave_size, 3);
        assert_eq!(s.scheduler.reset_every_jobs, None);
        assert_eq!(s.timeouts.reclaim_settle, Duration::ZERO);
        assert_eq!(s.timeouts.encode_base, Duration::from_secs(60));
    }

    #[test]
    fn zero_wave_size_is_rejected() {
        assert!(Settings::from_json_str(r#"{"scheduler": {"waveSize": 0}}"#).is_err());
    }

    #[test]
    fn source_extension_check_is_case_insensitive() {
        assert!(validate_source_extension(Path::new("/a/clip.MOV")).is_ok());
        assert!(validate_source_extension(Path::new("/a/clip.mkv")).is_err());
        assert!(validate_source_extension(Path::new("/a/clip")).is_err());
    }
}
