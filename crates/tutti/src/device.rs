//! Device side of the protocol.
//!
//! [`DeviceAgent`] dials a controller, says hello, and then keeps the link
//! alive: it answers sync requests from its own (possibly offset) clock,
//! sends heartbeats and status, and applies commands through a
//! [`CommandHandler`]. Commands are deduplicated by `(sessionId, commandId)`
//! across reconnects, so a replayed command gets the cached ack back without
//! being applied twice.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tuttiproto::timing::unix_nanos;
use tuttiproto::{
    AckPayload, Body, Capability, CommandId, CommandPayload, DeviceId, DisconnectPayload,
    FrameCodec, HelloPayload, Message, RetryPolicy, StatusPayload, SyncReplyPayload,
    PROTOCOL_VERSION,
};

/// How the device answers one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ack,
    Fail(String),
    /// Never answer; as if the command was lost, so a later copy is
    /// applied again
    Silent,
}

/// Applies commands on the device.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn apply(&self, command: &CommandPayload) -> Reply;

    fn status(&self) -> StatusPayload {
        StatusPayload::default()
    }
}

/// Acks everything except the command names it was told to fail or ignore.
#[derive(Debug, Default)]
pub struct ScriptedHandler {
    fail: HashSet<String>,
    silent: HashSet<String>,
    /// Command name -> deliveries still to ignore
    drop_first: Mutex<HashMap<String, u32>>,
    delay: Duration,
    applied: Mutex<Vec<CommandPayload>>,
}

impl ScriptedHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, command_name: impl Into<String>) -> Self {
        self.fail.insert(command_name.into());
        self
    }

    pub fn silent_on(mut self, command_name: impl Into<String>) -> Self {
        self.silent.insert(command_name.into());
        self
    }

    /// Ignore the first `count` deliveries of a command, then act normally.
    pub fn dropping_first(self, command_name: impl Into<String>, count: u32) -> Self {
        self.drop_first
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(command_name.into(), count);
        self
    }

    fn take_drop(&self, command_name: &str) -> bool {
        let mut drops = self.drop_first.lock().unwrap_or_else(|e| e.into_inner());
        match drops.get_mut(command_name) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }

    /// Simulated time to carry out each command before acking.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn log(&self) -> MutexGuard<'_, Vec<CommandPayload>> {
        self.applied.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every command applied so far, in order.
    pub fn applied(&self) -> Vec<CommandPayload> {
        self.log().clone()
    }

    pub fn applied_names(&self) -> Vec<String> {
        self.log().iter().map(|c| c.command_name.clone()).collect()
    }
}

#[async_trait]
impl CommandHandler for ScriptedHandler {
    async fn apply(&self, command: &CommandPayload) -> Reply {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.take_drop(&command.command_name) {
            return Reply::Silent;
        }
        self.log().push(command.clone());
        if self.silent.contains(&command.command_name) {
            Reply::Silent
        } else if self.fail.contains(&command.command_name) {
            Reply::Fail(format!("{} refused by device", command.command_name))
        } else {
            Reply::Ack
        }
    }
}

const LEDGER_CAPACITY: usize = 1024;

type LedgerKey = (String, CommandId);

/// Remembers the answer given to each `(sessionId, commandId)`.
#[derive(Debug, Default)]
pub struct CommandLedger {
    answers: HashMap<LedgerKey, Option<AckPayload>>,
    order: VecDeque<LedgerKey>,
}

impl CommandLedger {
    fn key(command: &CommandPayload) -> LedgerKey {
        (
            command.session_id.clone().unwrap_or_default(),
            command.command_id,
        )
    }

    /// `Some(answer)` when this command was already applied.
    pub fn lookup(&self, command: &CommandPayload) -> Option<Option<AckPayload>> {
        self.answers.get(&Self::key(command)).cloned()
    }

    pub fn record(&mut self, command: &CommandPayload, answer: Option<AckPayload>) {
        let key = Self::key(command);
        if self.answers.insert(key.clone(), answer).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > LEDGER_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.answers.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.answers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.answers.is_empty()
    }
}

#[derive(Debug, Default)]
struct AgentCounters {
    connections: AtomicU64,
    applied: AtomicU64,
    duplicates: AtomicU64,
    sync_replies: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AgentStats {
    pub connections: u64,
    pub applied: u64,
    pub duplicates: u64,
    pub sync_replies: u64,
}

#[derive(Debug, Clone)]
pub struct DeviceAgentConfig {
    pub device_id: DeviceId,
    pub name: Option<String>,
    pub capabilities: Vec<Capability>,
    /// Controller address, `host:port`
    pub controller: String,
    /// Added to the wall clock to simulate a device whose clock is off
    pub clock_offset: i64,
    pub heartbeat_interval: Duration,
    pub status_interval: Duration,
    pub hello_timeout: Duration,
    pub retry: RetryPolicy,
}

impl DeviceAgentConfig {
    pub fn new(device_id: impl Into<String>, controller: impl Into<String>) -> Self {
        Self {
            device_id: DeviceId::new(device_id),
            name: None,
            capabilities: Vec::new(),
            controller: controller.into(),
            clock_offset: 0,
            heartbeat_interval: Duration::from_secs(1),
            status_interval: Duration::from_secs(10),
            hello_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_capabilities(mut self, caps: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities = caps.into_iter().collect();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_clock_offset(mut self, offset: i64) -> Self {
        self.clock_offset = offset;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// How a single connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEnd {
    /// Stream closed or controller said goodbye; worth reconnecting
    Closed(String),
    Rejected(String),
    Shutdown,
}

#[derive(Clone)]
pub struct DeviceAgent {
    config: Arc<DeviceAgentConfig>,
    handler: Arc<dyn CommandHandler>,
    ledger: Arc<Mutex<CommandLedger>>,
    counters: Arc<AgentCounters>,
}

impl DeviceAgent {
    pub fn new(config: DeviceAgentConfig, handler: Arc<dyn CommandHandler>) -> Self {
        Self {
            config: Arc::new(config),
            handler,
            ledger: Arc::new(Mutex::new(CommandLedger::default())),
            counters: Arc::new(AgentCounters::default()),
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.config.device_id
    }

    pub fn stats(&self) -> AgentStats {
        AgentStats {
            connections: self.counters.connections.load(Ordering::Relaxed),
            applied: self.counters.applied.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            sync_replies: self.counters.sync_replies.load(Ordering::Relaxed),
        }
    }

    fn ledger(&self) -> MutexGuard<'_, CommandLedger> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn local_nanos(&self) -> i64 {
        unix_nanos() + self.config.clock_offset
    }

    /// Connect and stay connected until shutdown, a rejected hello, or the
    /// retry policy gives up. The failure count only resets once a hello is
    /// accepted, so a controller that accepts and drops the stream still
    /// exhausts the policy.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let mut failures = 0u32;
        loop {
            let end = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                connected = TcpStream::connect(&self.config.controller) => match connected {
                    Ok(stream) => {
                        let _ = stream.set_nodelay(true);
                        let before = self.counters.connections.load(Ordering::Relaxed);
                        let end = self.run_link(stream, shutdown.clone()).await;
                        if self.counters.connections.load(Ordering::Relaxed) > before {
                            failures = 0;
                        }
                        end
                    }
                    Err(e) => Err(anyhow::Error::new(e)
                        .context(format!("Failed to connect to {}", self.config.controller))),
                },
            };

            match end {
                Ok(LinkEnd::Shutdown) => return Ok(()),
                Ok(LinkEnd::Rejected(reason)) => bail!("controller rejected hello: {}", reason),
                Ok(LinkEnd::Closed(reason)) => {
                    info!(device_id = %self.config.device_id, "link closed: {}", reason)
                }
                Err(e) => warn!(device_id = %self.config.device_id, "link failed: {:#}", e),
            }

            failures += 1;
            if !self.config.retry.should_retry(failures) {
                bail!("giving up after {} failed attempts", failures);
            }
            let delay = self.config.retry.backoff_for_attempt(failures);
            debug!(device_id = %self.config.device_id, "reconnecting in {:?}", delay);
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Drive one connection to completion.
    pub async fn run_link<S>(&self, stream: S, shutdown: CancellationToken) -> Result<LinkEnd>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut framed = Framed::new(stream, FrameCodec::default());
        let mut seq = 0u64;
        let device = self.config.device_id.clone();

        let hello = HelloPayload {
            device_id: device.clone(),
            capabilities: self.config.capabilities.clone(),
            protocol_version: PROTOCOL_VERSION,
            device_name: self.config.name.clone(),
        };
        framed
            .send(Message::hello(hello).with_timestamp(self.local_nanos()))
            .await
            .context("Failed to send hello")?;

        let answer = timeout(self.config.hello_timeout, framed.next())
            .await
            .context("No helloAck from controller")?;
        match answer {
            None => return Ok(LinkEnd::Closed("closed during handshake".to_string())),
            Some(frame) => match frame?.body {
                Body::HelloAck(ack) if ack.accepted => {}
                Body::HelloAck(ack) => {
                    return Ok(LinkEnd::Rejected(
                        ack.reason.unwrap_or_else(|| "no reason given".to_string()),
                    ))
                }
                other => bail!("expected helloAck, got {}", other.kind()),
            },
        }
        self.counters.connections.fetch_add(1, Ordering::Relaxed);
        info!(device_id = %device, "🔗 connected to {}", self.config.controller);

        let mut heartbeat = interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut status = interval(self.config.status_interval);
        status.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let outgoing = tokio::select! {
                _ = shutdown.cancelled() => {
                    seq += 1;
                    let bye = Body::Disconnect(DisconnectPayload {
                        reason: Some("device shutting down".to_string()),
                    });
                    let _ = framed.send(self.envelope(seq, bye)).await;
                    return Ok(LinkEnd::Shutdown);
                }
                frame = framed.next() => {
                    let received_at = self.local_nanos();
                    let message = match frame {
                        Some(frame) => frame?,
                        None => return Ok(LinkEnd::Closed("controller closed stream".to_string())),
                    };
                    match message.body {
                        Body::Command(command) => self.on_command(command).await,
                        Body::SyncRequest(request) => {
                            self.counters.sync_replies.fetch_add(1, Ordering::Relaxed);
                            Some(Body::SyncReply(SyncReplyPayload {
                                exchange_id: request.exchange_id,
                                t0: request.t0,
                                t1: received_at,
                                t2: self.local_nanos(),
                            }))
                        }
                        Body::Disconnect(bye) => {
                            let reason = bye.reason.unwrap_or_else(|| "controller said goodbye".to_string());
                            return Ok(LinkEnd::Closed(reason));
                        }
                        Body::Heartbeat | Body::HelloAck(_) => None,
                        other => {
                            debug!(device_id = %device, "ignoring {}", other.kind());
                            None
                        }
                    }
                }
                _ = heartbeat.tick() => Some(Body::Heartbeat),
                _ = status.tick() => Some(Body::Status(self.handler.status())),
            };

            if let Some(body) = outgoing {
                seq += 1;
                framed.send(self.envelope(seq, body)).await?;
            }
        }
    }

    fn envelope(&self, seq: u64, body: Body) -> Message {
        Message::new(Some(self.config.device_id.clone()), seq, body)
            .with_timestamp(self.local_nanos())
    }

    async fn on_command(&self, command: CommandPayload) -> Option<Body> {
        let cached = self.ledger().lookup(&command);
        if let Some(answer) = cached {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(
                device_id = %self.config.device_id,
                command_id = command.command_id,
                "duplicate {}, replaying answer",
                command.command_name
            );
            return answer.map(Body::Ack);
        }

        let reply = self.handler.apply(&command).await;
        self.counters.applied.fetch_add(1, Ordering::Relaxed);
        let answer = match reply {
            Reply::Ack => Some(AckPayload::ok(command.command_id)),
            Reply::Fail(detail) => Some(AckPayload::failed(command.command_id, detail)),
            Reply::Silent => None,
        }
        .map(|mut ack| {
            ack.session_id = command.session_id.clone();
            ack
        });
        if let Some(ack) = &answer {
            self.ledger().record(&command, Some(ack.clone()));
        }
        answer.map(Body::Ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tuttiproto::HelloAckPayload;

    fn command(session: &str, id: CommandId, name: &str) -> CommandPayload {
        CommandPayload::new(id, name).with_session(session)
    }

    #[test]
    fn ledger_keys_on_session_and_id() {
        let mut ledger = CommandLedger::default();
        ledger.record(&command("s1", 1, "start"), Some(AckPayload::ok(1)));

        assert!(ledger.lookup(&command("s1", 1, "start")).is_some());
        assert!(ledger.lookup(&command("s2", 1, "start")).is_none());
        assert!(ledger.lookup(&command("s1", 2, "start")).is_none());
    }

    #[test]
    fn ledger_is_bounded() {
        let mut ledger = CommandLedger::default();
        for id in 0..(LEDGER_CAPACITY as u64 + 10) {
            ledger.record(&command("s", id, "configure"), None);
        }
        assert_eq!(ledger.len(), LEDGER_CAPACITY);
        assert!(ledger.lookup(&command("s", 0, "configure")).is_none());
    }

    #[tokio::test]
    async fn scripted_handler_replies() {
        let handler = ScriptedHandler::new().failing("start").silent_on("stop");
        assert_eq!(handler.apply(&command("s", 1, "configure")).await, Reply::Ack);
        assert!(matches!(handler.apply(&command("s", 2, "start")).await, Reply::Fail(_)));
        assert_eq!(handler.apply(&command("s", 3, "stop")).await, Reply::Silent);
        assert_eq!(handler.applied_names(), vec!["configure", "start", "stop"]);
    }

    #[tokio::test]
    async fn duplicate_command_is_not_reapplied() {
        let handler = Arc::new(ScriptedHandler::new());
        let config = DeviceAgentConfig::new("cam", "unused:0")
            .with_capabilities([Capability::Camera]);
        let agent = DeviceAgent::new(config, handler.clone());

        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let shutdown = CancellationToken::new();
        let link = tokio::spawn({
            let agent = agent.clone();
            let shutdown = shutdown.clone();
            async move { agent.run_link(ours, shutdown).await }
        });

        let mut controller = Framed::new(theirs, FrameCodec::default());
        let hello = controller.next().await.unwrap().unwrap();
        assert_eq!(hello.kind(), "hello");
        let accept = HelloAckPayload {
            accepted: true,
            protocol_version: PROTOCOL_VERSION,
            reason: None,
        };
        controller
            .send(Message::new(Some(DeviceId::from("cam")), 1, Body::HelloAck(accept)))
            .await
            .unwrap();

        let start = Body::Command(command("s1", 7, "start"));
        for seq in 2..4 {
            controller
                .send(Message::new(Some(DeviceId::from("cam")), seq, start.clone()))
                .await
                .unwrap();
        }

        let mut acks = Vec::new();
        while acks.len() < 2 {
            if let Body::Ack(ack) = controller.next().await.unwrap().unwrap().body {
                acks.push(ack);
            }
        }
        assert!(acks.iter().all(|a| a.command_id == 7 && a.success));
        assert_eq!(acks[0].session_id.as_deref(), Some("s1"));
        assert_eq!(handler.applied().len(), 1);
        assert_eq!(agent.stats().duplicates, 1);

        shutdown.cancel();
        assert_eq!(link.await.unwrap().unwrap(), LinkEnd::Shutdown);
        let bye = loop {
            let message = controller.next().await.unwrap().unwrap();
            if message.kind() == "disconnect" {
                break message;
            }
        };
        assert_eq!(bye.device_id, Some(DeviceId::from("cam")));
    }

    #[tokio::test]
    async fn dropped_delivery_is_applied_on_the_next_copy() {
        let handler = ScriptedHandler::new().dropping_first("start", 1);
        assert_eq!(handler.apply(&command("s", 1, "start")).await, Reply::Silent);
        assert!(handler.applied().is_empty());
        assert_eq!(handler.apply(&command("s", 1, "start")).await, Reply::Ack);
        assert_eq!(handler.applied_names(), vec!["start"]);
    }

    #[tokio::test]
    async fn gives_up_when_every_link_drops_before_hello_ack() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepter = tokio::spawn(async move {
            let mut accepted = 0u32;
            // accept, then hang up before answering the hello
            while let Ok((stream, _)) = listener.accept().await {
                accepted += 1;
                drop(stream);
                if accepted == 3 {
                    break;
                }
            }
            accepted
        });

        let config = DeviceAgentConfig::new("cam", addr.to_string())
            .with_capabilities([Capability::Camera])
            .with_retry(
                RetryPolicy::default()
                    .with_max_attempts(3)
                    .with_backoff(Duration::from_millis(5), Duration::from_millis(20)),
            );
        let agent = DeviceAgent::new(config, Arc::new(ScriptedHandler::new()));
        let result = timeout(Duration::from_secs(5), agent.clone().run(CancellationToken::new()))
            .await
            .expect("agent kept retrying");

        let err = result.unwrap_err();
        assert!(err.to_string().contains("giving up after 3"));
        assert_eq!(agent.stats().connections, 0);
        assert_eq!(accepter.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn rejected_hello_ends_link() {
        let agent = DeviceAgent::new(
            DeviceAgentConfig::new("cam", "unused:0"),
            Arc::new(ScriptedHandler::new()),
        );
        let (ours, theirs) = tokio::io::duplex(4096);
        let link = tokio::spawn({
            let agent = agent.clone();
            async move { agent.run_link(ours, CancellationToken::new()).await }
        });

        let mut controller = Framed::new(theirs, FrameCodec::default());
        controller.next().await.unwrap().unwrap();
        let refuse = HelloAckPayload {
            accepted: false,
            protocol_version: PROTOCOL_VERSION,
            reason: Some("version".into()),
        };
        controller
            .send(Message::new(Some(DeviceId::from("cam")), 1, Body::HelloAck(refuse)))
            .await
            .unwrap();

        assert_eq!(
            link.await.unwrap().unwrap(),
            LinkEnd::Rejected("version".into())
        );
    }
}
