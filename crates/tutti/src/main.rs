//! tutti - recording session controller
//!
//! Subcommands:
//! - `tutti serve` - Run the controller (device listener + operator API)
//! - `tutti config` - Print the effective configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tutti::telemetry;
use tutticonf::TuttiConfig;

#[derive(Parser)]
#[command(name = "tutti")]
#[command(about = "Coordinate synchronized recording sessions across devices")]
#[command(version)]
struct Cli {
    /// Config file, replacing ./tutti.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller
    Serve {
        /// TCP address devices connect to (overrides bind.device_listen)
        #[arg(long)]
        listen: Option<String>,

        /// HTTP port for the operator API (overrides bind.http_port)
        #[arg(long)]
        http_port: Option<u16>,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Also list the files and env vars that contributed
        #[arg(long)]
        sources: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (mut config, sources) = TuttiConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Config { sources: show } => {
            if show {
                for file in &sources.files {
                    println!("# file: {}", file.display());
                }
                for var in &sources.env_overrides {
                    println!("# env: {}", var);
                }
            }
            print!("{}", config.to_toml());
            Ok(())
        }
        Commands::Serve { listen, http_port } => {
            if let Some(listen) = listen {
                config.infra.bind.device_listen = listen;
            }
            if let Some(port) = http_port {
                config.infra.bind.http_port = port;
            }
            serve(config).await
        }
    }
}

async fn serve(config: TuttiConfig) -> Result<()> {
    telemetry::init("tutti", &config.infra.telemetry)
        .context("Failed to initialize telemetry")?;

    let shutdown = CancellationToken::new();
    let daemon = tutti::launch(&config, shutdown.clone()).await?;

    tracing::info!("🎼 tutti {} ready", env!("CARGO_PKG_VERSION"));
    tracing::info!("   Devices: tcp://{}", daemon.device_addr);
    tracing::info!("   Operator API: http://{}", daemon.http_addr);
    tracing::info!("   Reports: {}", config.infra.paths.report_dir.display());

    wait_for_signal().await?;

    if let Ok(Some(session)) = daemon.controller.current_session().await {
        tracing::warn!(
            session_id = %session.session_id,
            "shutting down with session in state {}",
            session.state
        );
    }
    shutdown.cancel();

    tracing::info!("Shutdown complete");
    telemetry::shutdown()?;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT, shutting down gracefully..."),
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down gracefully..."),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        tracing::info!("Received SIGINT, shutting down gracefully...");
    }
    Ok(())
}
