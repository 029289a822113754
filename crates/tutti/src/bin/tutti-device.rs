//! tutti-device - a simulated recording device
//!
//! Connects to a tutti controller, keeps its clock in sync, and acks
//! commands. Failures and silence can be scripted per command name to
//! rehearse abort paths.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tutti::device::{DeviceAgent, DeviceAgentConfig, ScriptedHandler};
use tuttiproto::timing::NANOS_PER_MILLI;
use tuttiproto::{Capability, RetryPolicy};

#[derive(Parser, Debug)]
#[command(name = "tutti-device")]
#[command(about = "Simulated device for a tutti controller")]
#[command(version)]
struct Cli {
    /// Device id, unique per controller
    #[arg(long)]
    id: String,

    /// Controller address
    #[arg(long, default_value = "127.0.0.1:7470")]
    controller: String,

    /// Human-readable name
    #[arg(long)]
    name: Option<String>,

    /// Capability tag (repeatable): camera, thermal, gsr, audio, imu
    #[arg(short = 'c', long = "capability", required = true)]
    capabilities: Vec<String>,

    /// Offset of the simulated local clock from wall time
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    clock_offset_ms: i64,

    /// Answer this command with success=false (repeatable)
    #[arg(long)]
    fail: Vec<String>,

    /// Never answer this command (repeatable)
    #[arg(long)]
    silent: Vec<String>,

    /// Time taken to apply each command
    #[arg(long, default_value = "0")]
    delay_ms: u64,

    /// Give up after this many failed connection attempts
    #[arg(long, default_value = "10")]
    max_attempts: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tutti=debug")),
        )
        .init();

    let mut handler = ScriptedHandler::new().with_delay(Duration::from_millis(cli.delay_ms));
    for name in cli.fail {
        handler = handler.failing(name);
    }
    for name in cli.silent {
        handler = handler.silent_on(name);
    }

    let retry = RetryPolicy::default().with_max_attempts(cli.max_attempts);

    let mut config = DeviceAgentConfig::new(cli.id, cli.controller)
        .with_capabilities(cli.capabilities.iter().map(|c| Capability::from(c.as_str())))
        .with_clock_offset(cli.clock_offset_ms * NANOS_PER_MILLI)
        .with_retry(retry);
    if let Some(name) = cli.name {
        config = config.with_name(name);
    }

    let agent = DeviceAgent::new(config, Arc::new(handler));
    tracing::info!(
        device_id = %agent.device_id(),
        "🎙️ tutti-device starting"
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received SIGINT, disconnecting...");
        }
        signal_token.cancel();
    });

    let stats_agent = agent.clone();
    agent.run(shutdown).await.context("Device agent stopped")?;

    let stats = stats_agent.stats();
    tracing::info!(
        connections = stats.connections,
        applied = stats.applied,
        duplicates = stats.duplicates,
        sync_replies = stats.sync_replies,
        "Shutdown complete"
    );
    Ok(())
}
