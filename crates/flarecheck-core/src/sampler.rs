//! Periodic frame sampling.
//!
//! Keeps one decoded frame every `interval_seconds` of nominal playback and
//! writes it into a per-video directory as `{base_name}_{index:04}.{extension}`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use crate::video::decoder::VideoDecoder;
use crate::video::FrameSource;

/// Seconds of playback between two sampled frames.
pub const DEFAULT_INTERVAL_SECONDS: f64 = 2.0;

/// Naming and spacing of sampled frames.
#[derive(Debug, Clone)]
pub struct SamplerOptions {
    pub base_name: String,
    /// File extension; also selects the image encoder.
    pub extension: String,
    pub interval_seconds: f64,
}

impl Default for SamplerOptions {
    fn default() -> Self {
        Self {
            base_name: "image".to_string(),
            extension: "jpg".to_string(),
            interval_seconds: DEFAULT_INTERVAL_SECONDS,
        }
    }
}

/// A frame written to disk by the sampler.
#[derive(Debug, Clone, PartialEq)]
pub struct SampledFrame {
    pub path: PathBuf,
    /// Playback position of the source frame. `None` when the video has no usable frame rate.
    pub timestamp_seconds: Option<f64>,
}

/// Number of source frames between two sampled frames. Never less than 1.
pub fn sampling_stride(fps: f64, interval_seconds: f64) -> u32 {
    let stride = (interval_seconds * fps).round();
    if stride.is_finite() && stride >= 1.0 {
        stride.min(u32::MAX as f64) as u32
    } else {
        1
    }
}

/// Sample frames from the video at `video_path` into `output_root/<video stem>/`.
///
/// A video that cannot be opened yields an empty list and a warning. Failing to
/// create the output directory or to write a frame is returned as an error.
pub fn sample_frames(
    video_path: &Path,
    output_root: &Path,
    options: &SamplerOptions,
) -> Result<Vec<PathBuf>> {
    let frames = sample_video(video_path, output_root, options, &AtomicBool::new(false))?;
    Ok(frames.into_iter().map(|f| f.path).collect())
}

/// Like [`sample_frames`], keeping each frame's playback time. Stops with an
/// error as soon as `cancelled` is raised.
pub fn sample_video(
    video_path: &Path,
    output_root: &Path,
    options: &SamplerOptions,
    cancelled: &AtomicBool,
) -> Result<Vec<SampledFrame>> {
    let mut decoder = match VideoDecoder::open(video_path) {
        Ok(decoder) => decoder,
        Err(e) => {
            warn!(?video_path, error = %format!("{e:#}"), "could not open video, no frames sampled");
            return Ok(Vec::new());
        }
    };

    let stem = video_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string());
    let frame_dir = output_root.join(stem);

    let frames = sample_frames_from(&mut decoder, &frame_dir, options, cancelled)?;
    info!(
        ?video_path,
        width = decoder.width(),
        height = decoder.height(),
        sampled = frames.len(),
        "frames have been saved"
    );
    Ok(frames)
}

/// Sample frames from any frame source into `frame_dir`, creating it if needed.
pub fn sample_frames_from<S: FrameSource>(
    source: &mut S,
    frame_dir: &Path,
    options: &SamplerOptions,
    cancelled: &AtomicBool,
) -> Result<Vec<SampledFrame>> {
    let fps = source.fps();
    let stride = sampling_stride(fps, options.interval_seconds);

    // Checked before the directory exists so a cancelled run leaves nothing behind.
    if cancelled.load(Ordering::Relaxed) {
        bail!("frame sampling was cancelled");
    }
    std::fs::create_dir_all(frame_dir)
        .with_context(|| format!("failed to create frame directory {}", frame_dir.display()))?;

    info!(?frame_dir, fps, stride, "sampling frames");

    let mut frames = Vec::new();
    loop {
        if cancelled.load(Ordering::Relaxed) {
            warn!(?frame_dir, sampled = frames.len(), "frame sampling cancelled");
            bail!("frame sampling was cancelled");
        }

        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %format!("{e:#}"), sampled = frames.len(), "decoder stopped early");
                break;
            }
        };

        if frame.frame_number % stride != 0 {
            continue;
        }

        let path = frame_dir.join(format!(
            "{}_{:04}.{}",
            options.base_name,
            frames.len(),
            options.extension
        ));
        frame
            .image
            .save(&path)
            .with_context(|| format!("failed to write frame to {}", path.display()))?;

        debug!(frame_number = frame.frame_number, ?path, "saved sampled frame");
        frames.push(SampledFrame {
            path,
            timestamp_seconds: (fps > 0.0).then_some(frame.timestamp_seconds),
        });
    }

    Ok(frames)
}
