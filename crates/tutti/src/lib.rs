//! Tutti: a controller that coordinates synchronized recording sessions
//! across heterogeneous devices.
//!
//! Devices dial in over TCP, speak the `tuttiproto` framing, and are kept on
//! a common reference timeline by per-connection clock synchronization. The
//! controller actor runs one session at a time through
//! configure → start → record → stop, and archives a report for each.

pub mod clock;
pub mod connection;
pub mod controller;
pub mod device;
pub mod error;
pub mod outbound;
pub mod registry;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod web;

pub use controller::{ControllerHandle, StartOutcome};
pub use error::{Result, TuttiError};

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tutticonf::TuttiConfig;

use connection::ConnectionContext;
use registry::DeviceRegistry;

/// A running controller: its handle and the addresses it bound.
pub struct Daemon {
    pub controller: ControllerHandle,
    pub device_addr: SocketAddr,
    pub http_addr: SocketAddr,
}

/// Bind the device listener and HTTP API, spawn the controller, and return.
/// Everything stops when `shutdown` is cancelled.
pub async fn launch(config: &TuttiConfig, shutdown: CancellationToken) -> anyhow::Result<Daemon> {
    tokio::fs::create_dir_all(&config.infra.paths.report_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to create report dir {}",
                config.infra.paths.report_dir.display()
            )
        })?;

    let registry = Arc::new(DeviceRegistry::new());
    let controller = controller::spawn(config, registry, shutdown.clone());

    let device_listener = TcpListener::bind(&config.infra.bind.device_listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.infra.bind.device_listen))?;
    let device_addr = device_listener.local_addr()?;
    let ctx = ConnectionContext {
        controller: controller.clone(),
        config: Arc::new(config.coordination.clone()),
    };
    tokio::spawn(server::run_device_listener(
        device_listener,
        ctx,
        shutdown.clone(),
    ));

    let http_bind: SocketAddr = format!("0.0.0.0:{}", config.infra.bind.http_port)
        .parse()
        .context("Failed to parse HTTP bind address")?;
    let http_listener = TcpListener::bind(http_bind)
        .await
        .with_context(|| format!("Failed to bind {}", http_bind))?;
    let http_addr = http_listener.local_addr()?;
    let app = web::router(web::WebState::new(controller.clone()));
    let http_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let server = axum::serve(http_listener, app).with_graceful_shutdown(async move {
            http_shutdown.cancelled().await;
        });
        if let Err(e) = server.await {
            error!("HTTP server shut down with error: {:?}", e);
        }
    });

    info!("🌐 Operator API on http://{}", http_addr);
    Ok(Daemon {
        controller,
        device_addr,
        http_addr,
    })
}
