//! Worker CLI for voxa.
//!
//! The worker parent spawns this binary as the job subprocess (`start`),
//! speaking the inference IPC protocol over stdio. `dev` is the same with
//! verbose logging; `download-files` prefetches the end-of-utterance model
//! into the local HuggingFace cache so first jobs don't block on network.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use voxa::VoxaConfig;
use voxa::job::{JobContext, JobHandler, run_job_process};

/// voxa: server-side runtime for real-time conversational voice agents.
#[derive(Parser)]
#[command(name = "voxa", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Command,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Run the job process with verbose logging.
    Dev,

    /// Run the job process (spawned by the worker parent).
    Start,

    /// Prefetch model files into the local HuggingFace cache.
    DownloadFiles {
        /// Turn-detector model repository.
        #[arg(long, env = "VOXA_EOU_MODEL", default_value = "voxa-ai/turn-detector")]
        model: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = match cli.command {
        Command::Dev => "voxa=debug",
        _ => "voxa=info",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match cli.config {
        Some(ref path) => VoxaConfig::from_file(path)?,
        None => default_config_path()
            .filter(|p| p.is_file())
            .map(|p| VoxaConfig::from_file(&p))
            .transpose()?
            .unwrap_or_default(),
    }
    .apply_env();

    match cli.command {
        Command::Dev | Command::Start => run_start(config).await,
        Command::DownloadFiles { model } => download_files(&model),
    }
}

/// Default handler used when the binary runs standalone. Deployments embed
/// the library and register their own [`JobHandler`]; this one only
/// acknowledges jobs so the IPC protocol can be exercised end to end.
struct StandaloneHandler;

#[async_trait]
impl JobHandler for StandaloneHandler {
    async fn prewarm(&self) {
        info!("prewarm complete");
    }

    async fn entry(&self, ctx: Arc<JobContext>) -> voxa::Result<()> {
        info!(job = %ctx.running_job, "job assigned");
        warn!("no agent module linked; embed voxa as a library to serve agents");
        ctx.cancellation_token().cancelled().await;
        Ok(())
    }
}

async fn run_start(config: VoxaConfig) -> anyhow::Result<()> {
    if config.worker.url.is_empty() {
        warn!("LIVEKIT_URL not set; running IPC-only");
    }
    info!("voxa v{} job process starting", env!("CARGO_PKG_VERSION"));
    run_job_process(
        Arc::new(StandaloneHandler),
        tokio::io::stdin(),
        tokio::io::stdout(),
    )
    .await?;
    Ok(())
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("voxa").join("voxa.toml"))
}

fn download_files(model: &str) -> anyhow::Result<()> {
    info!("downloading {model} into the HuggingFace cache");
    let api = hf_hub::api::sync::Api::new()?;
    let repo = api.model(model.to_string());
    for file in ["model_quantized.onnx", "tokenizer.json", "config.json"] {
        match repo.get(file) {
            Ok(path) => info!("cached {file} at {}", path.display()),
            Err(e) => warn!("could not fetch {file}: {e}"),
        }
    }
    Ok(())
}
