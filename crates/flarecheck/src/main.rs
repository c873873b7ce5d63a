mod cli;
mod server;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use flarecheck_core::pipeline;
use flarecheck_core::sampler::{self, SamplerOptions};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = cli::Cli::parse();

    match cli.command {
        cli::Command::Serve {
            bind,
            work_dir,
            max_upload_mb,
            services,
        } => {
            let work_dir = work_dir.unwrap_or_else(std::env::temp_dir);
            std::fs::create_dir_all(&work_dir)
                .with_context(|| format!("failed to create work directory {}", work_dir.display()))?;

            info!(%bind, ?work_dir, max_upload_mb, "starting server");

            let state = Arc::new(server::AppState {
                ctx: services.build_context(),
                work_dir,
            });
            server::serve(bind, state, max_upload_mb * 1024 * 1024).await
        }

        cli::Command::Sample {
            input,
            output,
            name,
            ext,
        } => {
            let options = SamplerOptions {
                base_name: name,
                extension: ext,
                ..SamplerOptions::default()
            };
            let paths = tokio::task::spawn_blocking(move || {
                sampler::sample_frames(&input, &output, &options)
            })
            .await
            .context("frame sampling task panicked")??;

            if paths.is_empty() {
                warn!("no frames were sampled");
            }
            for path in &paths {
                println!("{}", path.display());
            }
            Ok(())
        }

        cli::Command::Analyze { input, services } => {
            info!(?input, "starting analysis");

            let ctx = services.build_context();
            let scratch = tempfile::Builder::new()
                .prefix("flarecheck-")
                .tempdir()
                .context("failed to create scratch directory")?;

            let assessment = pipeline::process_video(&ctx, &input, Arc::new(scratch))
                .await
                .context("analysis failed")?;

            let json = serde_json::to_string_pretty(&assessment)
                .context("failed to serialize assessment")?;
            println!("{json}");

            info!(frames = assessment.frames.len(), "analysis complete");
            Ok(())
        }
    }
}
