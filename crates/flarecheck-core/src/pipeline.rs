use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tempfile::TempDir;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::llm::RiskAssessor;
use crate::sampler::{sample_video, SampledFrame, SamplerOptions};
use crate::transcribe::{transcribe_video, Transcriber};
use crate::vision::VisionClient;

/// Long-lived collaborators shared by every analysis.
pub struct AnalysisContext {
    pub sampler: SamplerOptions,
    pub transcriber: Arc<dyn Transcriber>,
    pub vision: VisionClient,
    pub assessor: RiskAssessor,
}

/// Description of one sampled frame.
#[derive(Debug, Clone, Serialize)]
pub struct FrameDescription {
    /// Position in the submitted frame list (0-based).
    pub index: usize,
    pub path: PathBuf,
    /// Playback position of the frame, when known.
    pub timestamp_seconds: Option<f64>,
    pub description: String,
}

/// Result of a full analysis, serialized as the HTTP response body.
#[derive(Debug, Clone, Serialize)]
pub struct Assessment {
    /// `"{seconds}s: {description}"` per analysed frame.
    pub analysis_results: Vec<String>,
    pub openai_risk_assessment: String,
    pub frames: Vec<FrameDescription>,
}

/// Label a frame by its playback time rounded to a tenth of a second, or by its position.
fn frame_label(index: usize, timestamp_seconds: Option<f64>) -> String {
    match timestamp_seconds {
        Some(t) => format!("{}s", (t * 10.0).round() / 10.0),
        None => format!("frame {index}"),
    }
}

/// Describe every existing image, then ask the language model for an overall verdict.
///
/// Images are assumed to be spaced by the sampler interval, so image `i` is
/// labelled `i * interval_seconds`. Paths that do not exist are skipped; their
/// position still counts.
pub async fn analyze_images(
    ctx: &AnalysisContext,
    image_paths: &[PathBuf],
    transcript: &str,
) -> Result<Assessment, PipelineError> {
    let frames: Vec<SampledFrame> = image_paths
        .iter()
        .enumerate()
        .map(|(index, path)| SampledFrame {
            path: path.clone(),
            timestamp_seconds: Some(index as f64 * ctx.sampler.interval_seconds),
        })
        .collect();
    analyze_frames(ctx, &frames, transcript).await
}

/// Describe every existing sampled frame and assess them together with `transcript`.
pub async fn analyze_frames(
    ctx: &AnalysisContext,
    sampled: &[SampledFrame],
    transcript: &str,
) -> Result<Assessment, PipelineError> {
    if transcript.trim().is_empty() {
        return Err(PipelineError::MissingTranscript);
    }
    if sampled.is_empty() {
        return Err(PipelineError::NoImagePaths);
    }

    let mut frames = Vec::new();
    for (index, frame) in sampled.iter().enumerate() {
        let path = &frame.path;
        if !path.exists() {
            warn!(?path, index, "image path does not exist, skipping");
            continue;
        }

        let description = ctx
            .vision
            .describe(path)
            .await
            .map_err(|source| PipelineError::Vision {
                path: path.clone(),
                source,
            })?;

        frames.push(FrameDescription {
            index,
            path: path.clone(),
            timestamp_seconds: frame.timestamp_seconds,
            description,
        });
    }

    if frames.is_empty() {
        return Err(PipelineError::NoValidImages);
    }

    let analysis_results: Vec<String> = frames
        .iter()
        .map(|f| format!("{}: {}", frame_label(f.index, f.timestamp_seconds), f.description))
        .collect();

    let verdict = ctx
        .assessor
        .assess(&analysis_results, transcript)
        .await
        .map_err(PipelineError::Assessment)?;

    info!(
        frames = frames.len(),
        skipped = sampled.len() - frames.len(),
        "analysis complete"
    );

    Ok(Assessment {
        analysis_results,
        openai_risk_assessment: verdict,
        frames,
    })
}

/// Raises its flag when dropped.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Sample frames from `video_path` into `scratch/frames`, transcribe its audio, and analyse both.
///
/// The blocking sampler holds its own handle on `scratch`, so the directory is
/// removed only after sampling has stopped. Dropping the returned future stops
/// the sampler at its next frame.
pub async fn process_video(
    ctx: &AnalysisContext,
    video_path: &Path,
    scratch: Arc<TempDir>,
) -> Result<Assessment, PipelineError> {
    let cancelled = Arc::new(AtomicBool::new(false));
    let _cancel_on_drop = CancelOnDrop(cancelled.clone());

    let sampled = {
        let video = video_path.to_path_buf();
        let options = ctx.sampler.clone();
        tokio::task::spawn_blocking(move || {
            let frames_root = scratch.path().join("frames");
            sample_video(&video, &frames_root, &options, &cancelled)
        })
        .await
        .context("frame sampling task panicked")
        .map_err(PipelineError::Sampling)?
        .map_err(PipelineError::Sampling)?
    };

    if sampled.is_empty() {
        return Err(PipelineError::UnreadableVideo);
    }
    info!(?video_path, frames = sampled.len(), "frames sampled");

    let transcript = transcribe_video(ctx.transcriber.as_ref(), video_path)
        .await
        .map_err(PipelineError::Transcription)?;

    analyze_frames(ctx, &sampled, &transcript).await
}
