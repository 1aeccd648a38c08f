mod cli;
mod config;
mod encode;
mod error;
mod handler;
mod job;
mod media;
mod platform;
mod server;

use std::sync::Arc;
use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use s2v_core::ModelSession;
use s2v_wan::WanS2v;
use crate::cli::{Cli, Commands};
use crate::config::WorkerConfig;
use crate::encode::OutputEncoder;
use crate::handler::JobHandler;
use crate::job::JobEnvelope;
use crate::media::MediaResolver;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "s2v_worker=info,s2v_wan=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = WorkerConfig::load()?;

    // Loaded once; a failure here means no job can ever be served.
    let model = match WanS2v::initialize(config.wan()) {
        Ok(model) => model,
        Err(e) => {
            error!("ModelLoadError: {}", e);
            return Err(e).context("model failed to load");
        }
    };
    let session = Arc::new(ModelSession::new(model));
    info!("Model session ready: {:?}", session.info());

    let handler = Arc::new(JobHandler::new(
        session,
        config.defaults.clone(),
        MediaResolver::new(&config.cache_dir)?.with_limits(config.max_download_bytes, config.cache_max_bytes),
        OutputEncoder::new(config.output_dir.clone()),
    ));

    match cli.command.unwrap_or(Commands::Worker) {
        Commands::Worker => {
            let platform = config
                .platform
                .clone()
                .context("RUNPOD_WEBHOOK_GET_JOB is not set; use `serve` or `run` outside the platform")?;
            platform::run(handler, platform).await?;
        }
        Commands::Serve { port } => {
            server::serve(handler, port.unwrap_or(config.port), config.max_body_bytes).await?;
        }
        Commands::Run { input } => {
            let raw = std::fs::read_to_string(&input)
                .with_context(|| format!("failed to read {}", input.display()))?;
            let job: JobEnvelope = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not a job payload", input.display()))?;

            let response = handler.handle(job).await;
            println!("{}", serde_json::to_string_pretty(&response)?);
            if !response.is_success() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
