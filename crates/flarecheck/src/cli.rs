use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use flarecheck_core::llm::{AssessorConfig, RiskAssessor};
use flarecheck_core::sampler::SamplerOptions;
use flarecheck_core::transcribe::{WhisperConfig, WhisperTranscriber};
use flarecheck_core::vision::{VisionClient, VisionConfig, DEFAULT_VISION_PROMPT};
use flarecheck_core::AnalysisContext;

#[derive(Parser)]
#[command(name = "flarecheck", about = "Flame-war risk checker for short videos")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the HTTP API.
    Serve {
        /// Address to listen on.
        #[arg(long, env = "FLARECHECK_BIND", default_value = "0.0.0.0:5000")]
        bind: SocketAddr,

        /// Directory for per-request scratch files (defaults to the system temp dir).
        #[arg(long, env = "FLARECHECK_WORK_DIR")]
        work_dir: Option<PathBuf>,

        /// Maximum upload size in MiB.
        #[arg(long, default_value_t = 512)]
        max_upload_mb: usize,

        #[command(flatten)]
        services: ServiceArgs,
    },

    /// Extract one frame every two seconds from a video, without any analysis.
    Sample {
        /// Path to the input video file.
        #[arg(short, long)]
        input: PathBuf,

        /// Root directory; frames go into a subdirectory named after the video.
        #[arg(short, long)]
        output: PathBuf,

        /// Frame file name prefix.
        #[arg(long, default_value = "image")]
        name: String,

        /// Frame file extension (selects the image format).
        #[arg(long, default_value = "jpg")]
        ext: String,
    },

    /// Analyze a local video file and print the JSON result.
    Analyze {
        /// Path to the input video file.
        #[arg(short, long)]
        input: PathBuf,

        #[command(flatten)]
        services: ServiceArgs,
    },
}

/// Endpoints and models of the external services.
#[derive(Args, Clone)]
pub struct ServiceArgs {
    /// Ollama server used to describe frames.
    #[arg(long, env = "OLLAMA_URL", default_value = "http://localhost:11434")]
    pub ollama_url: String,

    #[arg(long, env = "VISION_MODEL", default_value = "llava")]
    pub vision_model: String,

    #[arg(long, env = "VISION_PROMPT", default_value = DEFAULT_VISION_PROMPT)]
    pub vision_prompt: String,

    /// Give up on a frame description after this many seconds.
    #[arg(long, env = "VISION_TIMEOUT_SECS", default_value_t = 300)]
    pub vision_timeout_secs: u64,

    /// OpenAI-compatible API used for the risk assessment.
    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub openai_base_url: String,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    #[arg(long, env = "LLM_MODEL", default_value = "gpt-4o")]
    pub llm_model: String,

    /// Whisper-compatible transcription API.
    #[arg(long, env = "WHISPER_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub whisper_base_url: String,

    /// Falls back to the OpenAI key when unset.
    #[arg(long, env = "WHISPER_API_KEY", hide_env_values = true)]
    pub whisper_api_key: Option<String>,

    #[arg(long, env = "WHISPER_MODEL", default_value = "whisper-1")]
    pub whisper_model: String,

    /// Spoken language hint; pass an empty string to let the service detect it.
    #[arg(long, env = "WHISPER_LANGUAGE", default_value = "ja")]
    pub whisper_language: String,
}

impl ServiceArgs {
    /// Build the long-lived analysis collaborators.
    pub fn build_context(self) -> AnalysisContext {
        let whisper_api_key = self.whisper_api_key.or_else(|| self.openai_api_key.clone());
        let whisper_language = Some(self.whisper_language).filter(|l| !l.is_empty());

        AnalysisContext {
            sampler: SamplerOptions::default(),
            transcriber: Arc::new(WhisperTranscriber::new(WhisperConfig {
                base_url: self.whisper_base_url,
                api_key: whisper_api_key,
                model: self.whisper_model,
                language: whisper_language,
            })),
            vision: VisionClient::new(VisionConfig {
                base_url: self.ollama_url,
                model: self.vision_model,
                prompt: self.vision_prompt,
                timeout: Duration::from_secs(self.vision_timeout_secs),
            }),
            assessor: RiskAssessor::new(AssessorConfig {
                base_url: self.openai_base_url,
                api_key: self.openai_api_key,
                model: self.llm_model,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn sample_defaults_match_frame_naming() {
        let cli = Cli::try_parse_from(["flarecheck", "sample", "-i", "clip.mp4", "-o", "frames"]).unwrap();
        let Command::Sample { name, ext, .. } = cli.command else {
            panic!("expected sample subcommand");
        };
        assert_eq!(name, "image");
        assert_eq!(ext, "jpg");
    }

    #[test]
    fn serve_accepts_custom_endpoints() {
        let cli = Cli::try_parse_from([
            "flarecheck",
            "serve",
            "--bind",
            "127.0.0.1:8080",
            "--ollama-url",
            "http://gpu-box:11434",
            "--llm-model",
            "gpt-4o-mini",
        ])
        .unwrap();
        let Command::Serve { bind, services, .. } = cli.command else {
            panic!("expected serve subcommand");
        };
        assert_eq!(bind.port(), 8080);
        assert_eq!(services.ollama_url, "http://gpu-box:11434");
        assert_eq!(services.llm_model, "gpt-4o-mini");

        let ctx = services.build_context();
        assert_eq!(ctx.vision.model(), "llava");
        assert_eq!(ctx.assessor.model(), "gpt-4o-mini");
    }
}
