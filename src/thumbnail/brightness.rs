use image::RgbImage;

/// Every Nth pixel is sampled.
pub const SAMPLE_STEP: usize = 16;

/// Widest frame a brightness probe decodes.
pub const PROBE_WIDTH_PX: u32 = 320;

/// Mean perceptual luma (0-255) of every `step`th pixel in row-major order.
/// An empty image scores 0.
pub fn average_luma(frame: &RgbImage, step: usize) -> f64 {
    let step = step.max(1);
    let (sum, count) = frame
        .pixels()
        .step_by(step)
        .fold((0.0_f64, 0_u64), |(sum, count), p| {
            let [r, g, b] = p.0;
            let luma = 0.299 * f64::from(r) + 0.587 * f64::from(g) + 0.114 * f64::from(b);
            (sum + luma, count + 1)
        });
    if count == 0 { 0.0 } else { sum / count as f64 }
}
