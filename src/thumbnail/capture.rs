//! Thumbnail rendering: decode, optional face-aware crop, resize, JPEG.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::Serialize;

use super::crop::{FaceBox, plan_crop};
use crate::config::{AspectRatio, EngineTimeouts, OptimizationConfig};
use crate::engine::MediaInspector;
use crate::error::AppError;
use crate::ffmpeg::FrameWidth;

const JPEG_QUALITY: u8 = 90;
/// Captures stay this far before the end so the decoder still has a frame.
const END_MARGIN_SECS: f64 = 0.1;

/// Face detection model. Loading may be slow and is done once per job before captures.
pub trait FaceDetector: Send + Sync {
    fn ensure_loaded(&self) -> Result<(), AppError>;

    fn detect(&self, frame: &RgbImage) -> Result<Vec<FaceBox>, AppError>;
}

/// No model available: crops fall back to the image center.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledFaceDetector;

impl FaceDetector for DisabledFaceDetector {
    fn ensure_loaded(&self) -> Result<(), AppError> {
        Err(AppError::input("Face detection model is not available"))
    }

    fn detect(&self, _frame: &RgbImage) -> Result<Vec<FaceBox>, AppError> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Thumbnail {
    pub timestamp_seconds: f64,
    #[serde(skip)]
    pub image_bytes: Vec<u8>,
}

pub struct ThumbnailRenderer {
    inspector: Arc<dyn MediaInspector>,
    faces: Arc<dyn FaceDetector>,
    timeouts: EngineTimeouts,
}

impl ThumbnailRenderer {
    pub fn new(
        inspector: Arc<dyn MediaInspector>,
        faces: Arc<dyn FaceDetector>,
        timeouts: EngineTimeouts,
    ) -> Self {
        Self {
            inspector,
            faces,
            timeouts,
        }
    }

    /// One thumbnail per timestamp that could be captured; failures are skipped.
    pub async fn render_all(
        &self,
        source: &Path,
        duration: f64,
        timestamps: &[f64],
        config: &OptimizationConfig,
    ) -> Vec<Thumbnail> {
        let use_faces = config.thumbnail_face_detection
            && config.thumbnail_aspect_ratio != AspectRatio::Original
            && self.load_face_model().await;

        let mut thumbnails = Vec::with_capacity(timestamps.len());
        for (i, &requested) in timestamps.iter().enumerate() {
            let t = requested.clamp(0.0, (duration - END_MARGIN_SECS).max(0.0));
            let job = CaptureJob {
                inspector: Arc::clone(&self.inspector),
                faces: use_faces.then(|| Arc::clone(&self.faces)),
                source: source.to_path_buf(),
                timestamp: t,
                width: config.thumbnail_width_px,
                aspect: config.thumbnail_aspect_ratio,
            };
            let limit = self.timeouts.thumbnail_capture;
            let captured =
                tokio::time::timeout(limit, tokio::task::spawn_blocking(move || job.run())).await;
            match captured {
                Ok(Ok(Ok(bytes))) => {
                    if bytes.len() as u64 > config.thumbnail_target_size_bytes {
                        log::info!(
                            target: "budget_vid::thumbnail",
                            "Thumbnail {} is {} bytes (target {})",
                            i + 1,
                            bytes.len(),
                            config.thumbnail_target_size_bytes
                        );
                    }
                    thumbnails.push(Thumbnail {
                        timestamp_seconds: t,
                        image_bytes: bytes,
                    });
                }
                Ok(Ok(Err(e))) => log::warn!(
                    target: "budget_vid::thumbnail",
                    "Thumbnail {} at {:.2}s failed: {}",
                    i + 1,
                    t,
                    e
                ),
                Ok(Err(join_err)) => log::warn!(
                    target: "budget_vid::thumbnail",
                    "Thumbnail {} task failed: {}",
                    i + 1,
                    join_err
                ),
                Err(_) => log::warn!(
                    target: "budget_vid::thumbnail",
                    "Thumbnail {} at {:.2}s timed out after {:?}",
                    i + 1,
                    t,
                    limit
                ),
            }
        }
        if thumbnails.is_empty() {
            log::warn!(
                target: "budget_vid::thumbnail",
                "No thumbnails generated for {} (timestamps {:?})",
                source.display(),
                timestamps
            );
        }
        thumbnails
    }

    async fn load_face_model(&self) -> bool {
        let faces = Arc::clone(&self.faces);
        let limit = self.timeouts.face_model_load;
        let loaded =
            tokio::time::timeout(limit, tokio::task::spawn_blocking(move || faces.ensure_loaded()))
                .await;
        let err = match loaded {
            Ok(Ok(Ok(()))) => return true,
            Ok(Ok(Err(e))) => e.to_string(),
            Ok(Err(join_err)) => join_err.to_string(),
            Err(_) => format!("timed out after {:?}", limit),
        };
        log::warn!(
            target: "budget_vid::thumbnail",
            "Face detection model load failed, using center crop: {}",
            err
        );
        false
    }
}

struct CaptureJob {
    inspector: Arc<dyn MediaInspector>,
    faces: Option<Arc<dyn FaceDetector>>,
    source: PathBuf,
    timestamp: f64,
    width: u32,
    aspect: AspectRatio,
}

impl CaptureJob {
    fn run(self) -> Result<Vec<u8>, AppError> {
        // Face detection gets a larger frame at the source aspect, cropped afterwards.
        let decode_width = if self.faces.is_some() {
            self.width.saturating_mul(2)
        } else {
            self.width
        };
        let frame = self.inspector.decode_frame(
            &self.source,
            self.timestamp,
            FrameWidth::Exact(decode_width),
        )?;
        let faces = match &self.faces {
            Some(detector) => detector.detect(&frame).unwrap_or_else(|e| {
                log::warn!(
                    target: "budget_vid::thumbnail",
                    "Face detection failed at {:.2}s, using center crop: {}",
                    self.timestamp,
                    e
                );
                Vec::new()
            }),
            None => Vec::new(),
        };
        render_jpeg(&frame, self.aspect, &faces, self.width)
    }
}

/// Crops `frame` to `aspect` around `faces`, scales to `width` and encodes as JPEG.
pub fn render_jpeg(
    frame: &RgbImage,
    aspect: AspectRatio,
    faces: &[FaceBox],
    width: u32,
) -> Result<Vec<u8>, AppError> {
    let (src_w, src_h) = frame.dimensions();
    if src_w == 0 || src_h == 0 || width == 0 {
        return Err(AppError::input("Decoded frame is empty"));
    }
    let crop = plan_crop(src_w, src_h, aspect, faces);
    let cropped = imageops::crop_imm(frame, crop.x, crop.y, crop.width, crop.height).to_image();
    let out_h = match aspect.ratio() {
        Some(ratio) => f64::from(width) / ratio,
        None => f64::from(width) * f64::from(src_h) / f64::from(src_w),
    };
    let out_h = (out_h.round() as u32).max(1);
    let resized = imageops::resize(&cropped, width, out_h, FilterType::Triangle);

    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY).encode_image(&resized)?;
    Ok(bytes)
}
