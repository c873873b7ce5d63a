pub mod audio;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod sampler;
pub mod transcribe;
pub mod video;
pub mod vision;

pub use error::PipelineError;
pub use pipeline::{AnalysisContext, Assessment, FrameDescription};
