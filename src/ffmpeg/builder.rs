//! FFmpeg argument lists for budget transcodes and single-frame decodes.

/// Width bound for a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameWidth {
    /// Downscale to this width only if the source is wider (brightness probes).
    AtMost(u32),
    /// Scale to exactly this width (thumbnail captures).
    Exact(u32),
}

impl FrameWidth {
    fn scale_filter(self) -> String {
        match self {
            FrameWidth::AtMost(w) => format!("scale='min({w},iw)':-2"),
            FrameWidth::Exact(w) => format!("scale={w}:-2"),
        }
    }
}

/// Arguments for one encode attempt. Bitrates are bits per second.
///
/// Paths are relative to the engine's working directory.
pub fn build_transcode_args(
    input_name: &str,
    output_name: &str,
    video_bitrate_bps: u64,
    audio_bitrate_bps: u64,
    target_width_px: u32,
) -> Vec<String> {
    log::debug!(
        target: "budget_vid::ffmpeg::builder",
        "Building transcode: video_bps={}, audio_bps={}, width={}, input={} -> output={}",
        video_bitrate_bps,
        audio_bitrate_bps,
        target_width_px,
        input_name,
        output_name
    );

    vec![
        "-nostdin".to_string(),
        "-y".to_string(),
        "-progress".to_string(),
        "pipe:1".to_string(),
        "-i".to_string(),
        input_name.to_string(),
        "-vf".to_string(),
        format!("scale={}:-2", target_width_px),
        "-c:v".to_string(),
        "libx264".to_string(),
        "-b:v".to_string(),
        video_bitrate_bps.to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        audio_bitrate_bps.to_string(),
        "-preset".to_string(),
        "ultrafast".to_string(),
        "-movflags".to_string(),
        "+faststart".to_string(),
        output_name.to_string(),
    ]
}

/// Arguments that decode the frame at `timestamp_secs` and write it as PNG to stdout.
///
/// Input seek lands on the keyframe before `timestamp_secs` (fast); the output
/// seek then decodes forward to the exact frame.
pub fn build_frame_args(input_path: &str, timestamp_secs: f64, width: FrameWidth) -> Vec<String> {
    let t = timestamp_secs.max(0.0);
    let coarse = (t - 1.0).max(0.0);
    let fine = t - coarse;
    vec![
        "-nostdin".to_string(),
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-ss".to_string(),
        format!("{:.3}", coarse),
        "-i".to_string(),
        input_path.to_string(),
        "-ss".to_string(),
        format!("{:.3}", fine),
        "-frames:v".to_string(),
        "1".to_string(),
        "-an".to_string(),
        "-vf".to_string(),
        width.scale_filter(),
        "-f".to_string(),
        "image2pipe".to_string(),
        "-vcodec".to_string(),
        "png".to_string(),
        "pipe:1".to_string(),
    ]
}

/// Formats args for readable display: option and value on one line when the next arg is a value.
pub fn format_args_for_display_multiline(args: &[String]) -> String {
    let mut lines = Vec::new();
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        match iter.peek() {
            Some(value) if arg.starts_with('-') && !value.starts_with('-') => {
                lines.push(format!("  {} {}", arg, value));
                iter.next();
            }
            _ => lines.push(format!("  {}", arg)),
        }
    }
    lines.join("\n")
}
