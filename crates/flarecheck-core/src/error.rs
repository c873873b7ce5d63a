use std::path::PathBuf;

use thiserror::Error;

/// Failures of the analysis pipeline that a caller may want to tell apart.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no transcript was provided")]
    MissingTranscript,

    #[error("no image paths were provided")]
    NoImagePaths,

    #[error("none of the given image paths exist")]
    NoValidImages,

    #[error("no frames could be decoded from the video")]
    UnreadableVideo,

    #[error("frame sampling failed")]
    Sampling(#[source] anyhow::Error),

    #[error("transcription failed")]
    Transcription(#[source] anyhow::Error),

    #[error("image description failed for {}", .path.display())]
    Vision {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("risk assessment failed")]
    Assessment(#[source] anyhow::Error),
}

impl PipelineError {
    /// True when the request itself was unusable, as opposed to a collaborator failing.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            PipelineError::MissingTranscript
                | PipelineError::NoImagePaths
                | PipelineError::NoValidImages
                | PipelineError::UnreadableVideo
        )
    }

    /// True when an external service (vision, transcription, language model) failed.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            PipelineError::Transcription(_)
                | PipelineError::Vision { .. }
                | PipelineError::Assessment(_)
        )
    }
}
