//! Per-device connection handler.
//!
//! One task per accepted stream. The handler performs the hello handshake,
//! then multiplexes inbound frames, the device's outbox, heartbeats and its
//! own clock-sync schedule until the stream closes, goes silent past the
//! disconnect timeout, or is superseded by a newer connection.

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{interval, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tutticonf::CoordinationConfig;
use tuttiproto::timing::unix_nanos;
use tuttiproto::{
    Body, DeviceId, DisconnectPayload, FrameCodec, HelloAckPayload, Message, ProtocolError,
    SyncReplyPayload, SyncRequestPayload, PROTOCOL_VERSION,
};

use crate::clock::ClockSynchronizer;
use crate::controller::{ControlMessage, ControllerHandle, HelloDecision};
use crate::error::{Result, TuttiError};
use crate::outbound::DeviceOutbox;
use crate::registry::ConnectionState;

/// Everything a connection task needs from the daemon.
#[derive(Clone)]
pub struct ConnectionContext {
    pub controller: ControllerHandle,
    pub config: Arc<CoordinationConfig>,
}

#[derive(Debug, Clone, Copy)]
enum SyncPhase {
    Idle {
        next_at: Instant,
    },
    Awaiting {
        exchange_id: u64,
        t0: i64,
        expires: Instant,
    },
}

impl SyncPhase {
    fn deadline(&self) -> Instant {
        match self {
            SyncPhase::Idle { next_at } => *next_at,
            SyncPhase::Awaiting { expires, .. } => *expires,
        }
    }
}

/// Serve one device stream until it ends.
pub async fn serve_device<S>(stream: S, peer: Option<String>, ctx: ConnectionContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(
        stream,
        FrameCodec::new(ctx.config.connection.max_frame_bytes),
    );

    let first = match timeout(ctx.config.connection.hello_timeout(), framed.next()).await {
        Err(_) => return Err(TuttiError::Timeout("hello".to_string())),
        Ok(None) => {
            debug!(peer = ?peer, "closed before hello");
            return Ok(());
        }
        Ok(Some(frame)) => frame?,
    };
    let hello = match first.body {
        Body::Hello(hello) => hello,
        other => {
            return Err(ProtocolError::UnexpectedMessage {
                expected: "hello",
                got: other.kind().to_string(),
            }
            .into())
        }
    };
    let device = hello.device_id.clone();

    let (outbox, cancel, connection_id) = match ctx.controller.hello(hello, peer.clone()).await? {
        HelloDecision::Accepted {
            outbox,
            cancel,
            connection_id,
        } => (outbox, cancel, connection_id),
        HelloDecision::Rejected { reason } => {
            let refusal = HelloAckPayload {
                accepted: false,
                protocol_version: PROTOCOL_VERSION,
                reason: Some(reason),
            };
            framed
                .send(Message::new(Some(device), 0, Body::HelloAck(refusal)))
                .await?;
            return Ok(());
        }
    };

    let mut link = DeviceLink {
        framed,
        device: device.clone(),
        connection_id,
        outbox,
        clock: ClockSynchronizer::new(device.clone(), ctx.config.sync.clone()),
        ctx: ctx.clone(),
        seq: 0,
        next_exchange: 0,
        last_inbound: Instant::now(),
        stale: false,
    };

    let mut notice = DisconnectNotice {
        controller: ctx.controller.clone(),
        device,
        connection_id,
        reason: "connection task ended abnormally".to_string(),
    };
    let result = link.run(cancel).await;
    notice.reason = match &result {
        Ok(reason) => reason.clone(),
        Err(e) => e.to_string(),
    };
    drop(notice);
    result.map(|_| ())
}

/// Tells the controller a connection is gone when dropped, including while
/// the connection task unwinds from a panic.
struct DisconnectNotice {
    controller: ControllerHandle,
    device: DeviceId,
    connection_id: u64,
    reason: String,
}

impl Drop for DisconnectNotice {
    fn drop(&mut self) {
        self.controller.notify_detached(ControlMessage::Disconnected {
            device: self.device.clone(),
            connection_id: self.connection_id,
            reason: std::mem::take(&mut self.reason),
        });
    }
}

struct DeviceLink<S> {
    framed: Framed<S, FrameCodec>,
    device: DeviceId,
    connection_id: u64,
    outbox: Arc<DeviceOutbox>,
    clock: ClockSynchronizer,
    ctx: ConnectionContext,
    seq: u64,
    next_exchange: u64,
    last_inbound: Instant,
    stale: bool,
}

impl<S> DeviceLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn send(&mut self, body: Body) -> Result<()> {
        self.seq += 1;
        let message = Message::new(Some(self.device.clone()), self.seq, body);
        self.framed.send(message).await?;
        Ok(())
    }

    /// Returns the reason the link ended cleanly.
    async fn run(&mut self, cancel: CancellationToken) -> Result<String> {
        self.send(Body::HelloAck(HelloAckPayload {
            accepted: true,
            protocol_version: PROTOCOL_VERSION,
            reason: None,
        }))
        .await?;
        self.ctx
            .controller
            .notify(ControlMessage::Activated {
                device: self.device.clone(),
                connection_id: self.connection_id,
            })
            .await;
        info!(device_id = %self.device, connection_id = self.connection_id, "🔗 device connected");

        let config = self.ctx.config.clone();
        let mut heartbeat = interval(config.connection.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sync = SyncPhase::Idle {
            next_at: Instant::now(),
        };

        self.drain().await?;

        loop {
            let sync_at = sync.deadline();
            tokio::select! {
                _ = cancel.cancelled() => {
                    let bye = DisconnectPayload {
                        reason: Some("superseded".to_string()),
                    };
                    let _ = self.send(Body::Disconnect(bye)).await;
                    return Ok("superseded or shutting down".to_string());
                }
                frame = self.framed.next() => {
                    let t3 = unix_nanos();
                    let message = match frame {
                        Some(frame) => frame?,
                        None => return Ok("closed by device".to_string()),
                    };
                    if let Some(reason) = self.on_message(message, t3, &mut sync).await? {
                        return Ok(reason);
                    }
                }
                _ = self.outbox.notified() => self.drain().await?,
                _ = heartbeat.tick() => self.on_heartbeat().await?,
                _ = sleep_until(sync_at) => self.on_sync_timer(&mut sync).await?,
            }
        }
    }

    async fn drain(&mut self) -> Result<()> {
        while let Some(body) = self.outbox.pop() {
            if let Body::Command(command) = &body {
                debug!(
                    device_id = %self.device,
                    command_id = command.command_id,
                    "→ {}",
                    command.command_name
                );
            }
            self.send(body).await?;
        }
        Ok(())
    }

    async fn on_heartbeat(&mut self) -> Result<()> {
        let silent = self.last_inbound.elapsed();
        let connection = &self.ctx.config.connection;
        if silent > connection.disconnect_timeout() {
            warn!(device_id = %self.device, "silent for {:?}, dropping connection", silent);
            return Err(TuttiError::Timeout(format!(
                "traffic from {} within {:?}",
                self.device,
                connection.disconnect_timeout()
            )));
        }
        if silent > connection.heartbeat_timeout() && !self.stale {
            self.stale = true;
            self.ctx
                .controller
                .notify(ControlMessage::Stale {
                    device: self.device.clone(),
                })
                .await;
        }
        self.outbox.push(Body::Heartbeat);
        Ok(())
    }

    async fn on_sync_timer(&mut self, sync: &mut SyncPhase) -> Result<()> {
        if let SyncPhase::Awaiting { exchange_id, .. } = *sync {
            let err = TuttiError::Timeout(format!("sync reply {}", exchange_id));
            debug!(device_id = %self.device, "{}", err);
            self.clock.record_timeout();
            self.publish_sync().await;
            *sync = SyncPhase::Idle {
                next_at: Instant::now() + self.clock.next_interval(),
            };
            return Ok(());
        }

        self.next_exchange += 1;
        let exchange_id = self.next_exchange;
        let t0 = unix_nanos();
        self.send(Body::SyncRequest(SyncRequestPayload { exchange_id, t0 }))
            .await?;
        *sync = SyncPhase::Awaiting {
            exchange_id,
            t0,
            expires: Instant::now() + self.ctx.config.sync.reply_timeout(),
        };
        Ok(())
    }

    async fn publish_sync(&mut self) {
        self.ctx
            .controller
            .notify(ControlMessage::SyncUpdate {
                device: self.device.clone(),
                snapshot: self.clock.snapshot(),
            })
            .await;
    }

    /// Handle one inbound frame. Returns a reason when the device said goodbye.
    async fn on_message(
        &mut self,
        message: Message,
        t3: i64,
        sync: &mut SyncPhase,
    ) -> Result<Option<String>> {
        self.last_inbound = Instant::now();
        let state = self.ctx.controller.registry().touch(&self.device);
        if self.stale || state == Some(ConnectionState::Stale) {
            self.stale = false;
            self.ctx
                .controller
                .notify(ControlMessage::Revived {
                    device: self.device.clone(),
                })
                .await;
        }

        if let Some(claimed) = &message.device_id {
            if claimed != &self.device {
                warn!(device_id = %self.device, "frame claims to be from {}, ignoring", claimed);
                return Ok(None);
            }
        }

        match message.body {
            Body::Ack(ack) => {
                if let Some(latency) = self.outbox.acknowledge(ack.command_id) {
                    debug!(
                        device_id = %self.device,
                        command_id = ack.command_id,
                        success = ack.success,
                        "← ack after {:?}",
                        latency
                    );
                }
                self.ctx
                    .controller
                    .notify(ControlMessage::Ack {
                        device: self.device.clone(),
                        ack,
                    })
                    .await;
            }
            Body::Status(status) => {
                self.ctx
                    .controller
                    .notify(ControlMessage::Status {
                        device: self.device.clone(),
                        status,
                    })
                    .await;
            }
            Body::SyncReply(reply) => match *sync {
                SyncPhase::Awaiting { exchange_id, t0, .. } if exchange_id == reply.exchange_id => {
                    let sample = self.clock.record_exchange(t0, reply.t1, reply.t2, t3);
                    debug!(
                        device_id = %self.device,
                        delay_ns = sample.delay_ns,
                        offset_ns = sample.offset_ns,
                        accepted = sample.accepted,
                        "sync exchange {}",
                        exchange_id
                    );
                    self.publish_sync().await;
                    *sync = SyncPhase::Idle {
                        next_at: Instant::now() + self.clock.next_interval(),
                    };
                }
                _ => debug!(device_id = %self.device, "late sync reply {}", reply.exchange_id),
            },
            Body::SyncRequest(request) => {
                let reply = SyncReplyPayload {
                    exchange_id: request.exchange_id,
                    t0: request.t0,
                    t1: t3,
                    t2: unix_nanos(),
                };
                self.send(Body::SyncReply(reply)).await?;
            }
            Body::DataNotify(notice) => {
                debug!(
                    device_id = %self.device,
                    stream_id = %notice.stream_id,
                    "data notify #{}",
                    notice.sequence_number
                );
            }
            Body::Heartbeat => {}
            Body::Disconnect(bye) => {
                let reason = bye.reason.unwrap_or_else(|| "device said goodbye".to_string());
                info!(device_id = %self.device, "device disconnecting: {}", reason);
                return Ok(Some(reason));
            }
            other => {
                debug!(device_id = %self.device, "ignoring {} from device", other.kind());
            }
        }
        Ok(None)
    }
}
