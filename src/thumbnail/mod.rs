//! Thumbnail selection and rendering.

pub mod brightness;
mod capture;
mod crop;
pub mod timestamps;

pub use capture::{DisabledFaceDetector, FaceDetector, Thumbnail, ThumbnailRenderer, render_jpeg};
pub use crop::{CropRect, FaceBox, plan_crop};
pub use timestamps::{
    BrightnessProbe, DEFAULT_BRIGHTNESS_THRESHOLD, InspectorProbe, ThumbnailCandidate,
    base_timestamps, select_timestamps,
};
