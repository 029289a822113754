//! Device listener: accepts TCP connections and hands each to its own task.

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{serve_device, ConnectionContext};
use crate::error::TuttiError;

/// Accept device connections until `shutdown` fires.
pub async fn run_device_listener(
    listener: TcpListener,
    ctx: ConnectionContext,
    shutdown: CancellationToken,
) {
    match listener.local_addr() {
        Ok(addr) => info!("📡 Listening for devices on {}", addr),
        Err(e) => warn!("Device listener has no local address: {}", e),
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Device listener shutting down");
                break;
            }
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        continue;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(peer = %addr, "set_nodelay failed: {}", e);
                }

                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let peer = addr.to_string();
                    match serve_device(stream, Some(peer.clone()), ctx).await {
                        Ok(()) => debug!(peer = %peer, "connection closed"),
                        Err(TuttiError::Timeout(what)) => {
                            info!(peer = %peer, "connection timed out waiting for {}", what)
                        }
                        Err(e) => warn!(peer = %peer, "connection ended: {}", e),
                    }
                });
            }
        }
    }
}
