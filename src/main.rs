use anyhow::{Context, Result};
use clap::Parser;
use musiclib_sync::config::{AppConfig, CliConfig, FileConfig};
use musiclib_sync::orchestrator::Orchestrator;
use musiclib_sync::server::{self, run_server};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to a TOML config file. Values in the file override CLI values.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory holding the library database. Without it the library lives in memory.
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// The port the admin server listens on.
    #[clap(short, long, default_value_t = 3002)]
    pub port: u16,

    /// Seconds between scheduler cycles.
    #[clap(long, default_value_t = 60)]
    pub tick_interval_secs: u64,

    /// Music folder imported as the `local` source when no [[sources]] are configured.
    #[clap(long, value_parser = parse_path)]
    pub library_path: Option<PathBuf>,

    /// URL of the downloader service. Download dispatch is off without it.
    #[clap(long)]
    pub downloader_url: Option<String>,
}

impl From<&CliArgs> for CliConfig {
    fn from(args: &CliArgs) -> Self {
        CliConfig {
            db_dir: args.db_dir.clone(),
            port: args.port,
            tick_interval_secs: args.tick_interval_secs,
            library_path: args.library_path.clone(),
            downloader_url: args.downloader_url.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let config = AppConfig::resolve(&CliConfig::from(&cli_args), file_config)?;

    info!("Initializing metrics...");
    server::metrics::init_metrics();

    let shutdown = CancellationToken::new();
    let orchestrator = Orchestrator::new(&config, shutdown.clone())?;

    let server_state = orchestrator.server_state();
    let server_shutdown = shutdown.clone();
    let port = config.port;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = run_server(server_state, port, server_shutdown.clone()).await {
            error!("Admin server failed: {:#}", e);
            server_shutdown.cancel();
        }
    });

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down...");
                signal_shutdown.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    orchestrator.run().await;

    if let Err(e) = server_handle.await {
        error!("Admin server task panicked: {}", e);
    }
    info!("Shutdown complete");
    Ok(())
}
