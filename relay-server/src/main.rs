use anyhow::{Context, Result};
use clap::Parser;
use relay_config::{ConfigError, RelayConfig};
use relay_server::{run_server, AppState};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use transcoder::CommandLauncher;

/// DVR relay - shares DVR live views with browsers and records channels to MP4
#[derive(Parser, Debug)]
#[command(name = "dvr-relay")]
#[command(about = "Relay DVR channels to browsers over WebSocket and record them to disk")]
struct Cli {
    /// Config file (default: ~/.config/dvr-relay/relay.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides the config file
    #[arg(short, long)]
    bind: Option<String>,

    /// Debug logging, including transcoder stderr
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }

    match transcoder::ffmpeg_version(&config.transcoder.ffmpeg_path).await {
        Ok(version) => tracing::info!("Using {}", version),
        Err(e) => tracing::warn!("ffmpeg check failed, streams will not start: {}", e),
    }
    tracing::info!(
        "DVR {}:{} with {} channel(s), recordings in {}",
        config.dvr.host,
        config.dvr.rtsp_port,
        config.dvr.channels.len(),
        config.recording.dir.display()
    );

    let bind = config.server.bind.clone();
    let launcher = Arc::new(CommandLauncher::new(config.transcoder.read_chunk_size));
    let state = Arc::new(AppState::new(config, launcher));

    run_server(&bind, state, shutdown_signal()).await
}

/// An explicit path must exist; a missing default file means defaults.
fn load_config(path: Option<&std::path::Path>) -> Result<RelayConfig> {
    if let Some(path) = path {
        return RelayConfig::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()));
    }
    match RelayConfig::load() {
        Ok(config) => Ok(config),
        Err(ConfigError::NotFound(path)) => {
            tracing::warn!("No config at {}, using defaults", path);
            let config = RelayConfig::default();
            config.validate()?;
            Ok(config)
        }
        Err(e) => Err(e).context("Failed to load config"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutting down");
}
