//! The controller actor.
//!
//! One task owns the orchestrator, the link to every connection handler and
//! the armed start/stop deadline. Connection handlers and the HTTP surface
//! talk to it through [`ControllerHandle`]; every session transition and
//! registry state change is applied here, in arrival order.

use serde::Serialize;
use std::collections::HashMap;
use std::future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tutticonf::{CoordinationConfig, TuttiConfig};
use tuttiproto::timing::unix_nanos;
use tuttiproto::{
    AckPayload, Body, DeviceId, HelloPayload, RetryPolicy, StatusPayload, PROTOCOL_VERSION,
};

use crate::clock::SyncSnapshot;
use crate::error::{Result, TuttiError};
use crate::outbound::{DeviceOutbox, PushOutcome};
use crate::registry::{DeviceRegistry, Registration};
use crate::session::{
    DeadlineKind, DeviceView, Orchestrator, Outcome, SessionError, SessionId, SessionReport,
    SessionRequest, SessionState, SessionView, Step,
};

const CHANNEL_CAPACITY: usize = 1024;
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Answer to a device hello.
#[derive(Debug)]
pub enum HelloDecision {
    Accepted {
        outbox: Arc<DeviceOutbox>,
        /// Cancelled when a newer connection supersedes this one
        cancel: CancellationToken,
        connection_id: u64,
    },
    Rejected {
        reason: String,
    },
}

/// How a start request ended.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartOutcome {
    Recording { session: SessionView },
    Aborted { report: SessionReport },
}

type Reply<T> = oneshot::Sender<Result<T>>;

pub enum ControlMessage {
    Hello {
        hello: HelloPayload,
        peer: Option<String>,
        reply: Reply<HelloDecision>,
    },
    /// helloAck was written; the device is live
    Activated {
        device: DeviceId,
        connection_id: u64,
    },
    Ack {
        device: DeviceId,
        ack: AckPayload,
    },
    Status {
        device: DeviceId,
        status: StatusPayload,
    },
    SyncUpdate {
        device: DeviceId,
        snapshot: SyncSnapshot,
    },
    Stale {
        device: DeviceId,
    },
    Revived {
        device: DeviceId,
    },
    Disconnected {
        device: DeviceId,
        connection_id: u64,
        reason: String,
    },

    CreateSession {
        request: SessionRequest,
        reply: Reply<SessionView>,
    },
    StartSession {
        reply: Reply<StartOutcome>,
    },
    StopSession {
        reply: Reply<SessionReport>,
    },
    AbortSession {
        reason: String,
        reply: Reply<SessionReport>,
    },
    Demote {
        device: DeviceId,
        reply: Reply<SessionView>,
    },
    Retry {
        demote: Vec<DeviceId>,
        reply: Reply<SessionView>,
    },
    CurrentSession {
        reply: Reply<Option<SessionView>>,
    },
    Reports {
        reply: Reply<Vec<SessionReport>>,
    },
}

/// Cloneable entry point to the controller.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<ControlMessage>,
    registry: Arc<DeviceRegistry>,
}

impl ControllerHandle {
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Fire-and-forget event from a connection handler.
    pub async fn notify(&self, message: ControlMessage) {
        if self.tx.send(message).await.is_err() {
            debug!("controller stopped, dropping event");
        }
    }

    /// Deliver an event from a context that cannot await, such as `Drop`.
    pub fn notify_detached(&self, message: ControlMessage) {
        match self.tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    warn!("controller queue full and no runtime, dropping event");
                    return;
                };
                let tx = self.tx.clone();
                runtime.spawn(async move {
                    let _ = tx.send(message).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("controller stopped, dropping event");
            }
        }
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> ControlMessage) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| TuttiError::ControllerUnavailable)?;
        rx.await.map_err(|_| TuttiError::ControllerUnavailable)?
    }

    pub async fn hello(&self, hello: HelloPayload, peer: Option<String>) -> Result<HelloDecision> {
        self.request(|reply| ControlMessage::Hello { hello, peer, reply })
            .await
    }

    pub async fn create_session(&self, request: SessionRequest) -> Result<SessionView> {
        self.request(|reply| ControlMessage::CreateSession { request, reply })
            .await
    }

    /// Broadcast start and wait until the session records or aborts.
    pub async fn start_session(&self) -> Result<StartOutcome> {
        self.request(|reply| ControlMessage::StartSession { reply })
            .await
    }

    /// Broadcast stop and wait for the final report.
    pub async fn stop_session(&self) -> Result<SessionReport> {
        self.request(|reply| ControlMessage::StopSession { reply })
            .await
    }

    pub async fn abort_session(&self, reason: impl Into<String>) -> Result<SessionReport> {
        let reason = reason.into();
        self.request(|reply| ControlMessage::AbortSession { reason, reply })
            .await
    }

    pub async fn demote(&self, device: DeviceId) -> Result<SessionView> {
        self.request(|reply| ControlMessage::Demote { device, reply })
            .await
    }

    pub async fn retry(&self, demote: Vec<DeviceId>) -> Result<SessionView> {
        self.request(|reply| ControlMessage::Retry { demote, reply })
            .await
    }

    pub async fn current_session(&self) -> Result<Option<SessionView>> {
        self.request(|reply| ControlMessage::CurrentSession { reply })
            .await
    }

    pub async fn reports(&self) -> Result<Vec<SessionReport>> {
        self.request(|reply| ControlMessage::Reports { reply })
            .await
    }
}

struct Link {
    connection_id: u64,
    cancel: CancellationToken,
}

struct Armed {
    session_id: SessionId,
    kind: DeadlineKind,
    at: Instant,
}

/// Next re-send of unacked start/stop commands within an armed wait.
struct Resend {
    /// 1-based; the number of re-sends made so far is `attempt - 1`
    attempt: u32,
    at: Instant,
}

pub struct Controller {
    config: CoordinationConfig,
    report_dir: PathBuf,
    registry: Arc<DeviceRegistry>,
    orchestrator: Orchestrator,
    rx: mpsc::Receiver<ControlMessage>,
    links: HashMap<DeviceId, Link>,
    outboxes: HashMap<DeviceId, Arc<DeviceOutbox>>,
    deadline: Option<Armed>,
    resend: Option<Resend>,
    command_retry: RetryPolicy,
    start_waiters: Vec<Reply<StartOutcome>>,
    stop_waiters: Vec<Reply<SessionReport>>,
    next_connection_id: u64,
    shutdown: CancellationToken,
}

impl Controller {
    pub fn new(
        config: &TuttiConfig,
        registry: Arc<DeviceRegistry>,
        shutdown: CancellationToken,
    ) -> (Self, ControllerHandle) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let controller = Self {
            config: config.coordination.clone(),
            report_dir: config.infra.paths.report_dir.clone(),
            registry: registry.clone(),
            orchestrator: Orchestrator::new(config.coordination.session.clone()),
            rx,
            links: HashMap::new(),
            outboxes: HashMap::new(),
            deadline: None,
            resend: None,
            command_retry: command_retry_policy(&config.coordination),
            start_waiters: Vec::new(),
            stop_waiters: Vec::new(),
            next_connection_id: 0,
            shutdown,
        };
        (controller, ControllerHandle { tx, registry })
    }

    pub async fn run(mut self) {
        let mut sweep = tokio::time::interval(self.config.connection.stale_sweep_interval());
        let mut stats = tokio::time::interval(STATS_INTERVAL);
        info!("🎼 controller running");

        loop {
            let deadline = self.deadline.as_ref().map(|a| a.at);
            let resend = self.resend.as_ref().map(|r| r.at);
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                message = self.rx.recv() => match message {
                    Some(message) => self.handle(message).await,
                    None => break,
                },
                _ = sleep_until_armed(deadline) => self.deadline_elapsed().await,
                _ = sleep_until_armed(resend) => self.resend_elapsed().await,
                _ = sweep.tick() => self.sweep(),
                _ = stats.tick() => self.log_stats(),
            }
        }

        for (device, link) in self.links.drain() {
            debug!(device_id = %device, "closing link on shutdown");
            link.cancel.cancel();
        }
        info!("controller stopped");
    }

    async fn handle(&mut self, message: ControlMessage) {
        let now = unix_nanos();
        match message {
            ControlMessage::Hello { hello, peer, reply } => {
                let _ = reply.send(Ok(self.on_hello(hello, peer)));
            }
            ControlMessage::Activated {
                device,
                connection_id,
            } => {
                if self.is_current(&device, connection_id) {
                    self.registry.mark_active(&device);
                    self.orchestrator.device_connected(&device);
                }
            }
            ControlMessage::Ack { device, ack } => {
                let result = self.orchestrator.record_ack(&device, &ack, now);
                self.settle(result).await;
            }
            ControlMessage::Status { device, status } => {
                self.registry.record_status(&device, status);
            }
            ControlMessage::SyncUpdate { device, snapshot } => {
                self.on_sync(&device, snapshot);
            }
            ControlMessage::Stale { device } => {
                self.registry.mark_stale(&device);
            }
            ControlMessage::Revived { device } => {
                self.registry.mark_active(&device);
            }
            ControlMessage::Disconnected {
                device,
                connection_id,
                reason,
            } => {
                if !self.is_current(&device, connection_id) {
                    debug!(device_id = %device, connection_id, "superseded connection closed");
                    return;
                }
                self.links.remove(&device);
                self.registry.mark_disconnected(&device);
                info!(device_id = %device, "connection closed: {}", reason);
                let result = self.orchestrator.device_disconnected(&device, now);
                self.settle(result).await;
            }

            ControlMessage::CreateSession { request, reply } => {
                let views = self.candidates();
                let result = match self.orchestrator.configure(request, &views, now) {
                    Ok(step) => {
                        self.apply(step).await;
                        self.current_view()
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            ControlMessage::StartSession { reply } => {
                let views = self.candidates();
                match self.orchestrator.start(&views, now) {
                    Ok(step) => {
                        self.start_waiters.push(reply);
                        self.apply(step).await;
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e.into()));
                    }
                }
            }
            ControlMessage::StopSession { reply } => match self.orchestrator.stop(now) {
                Ok(step) => {
                    self.stop_waiters.push(reply);
                    self.apply(step).await;
                }
                Err(e) => {
                    let _ = reply.send(Err(e.into()));
                }
            },
            ControlMessage::AbortSession { reason, reply } => {
                match self.orchestrator.abort(reason, now) {
                    Ok(step) => {
                        let report = step.finished.clone();
                        self.apply(step).await;
                        let _ = reply.send(report.ok_or(SessionError::NoActiveSession.into()));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e.into()));
                    }
                }
            }
            ControlMessage::Demote { device, reply } => {
                let result = match self.orchestrator.demote(&device, now) {
                    Ok(step) => {
                        self.apply(step).await;
                        self.current_view()
                    }
                    Err(e) => Err(e.into()),
                };
                let _ = reply.send(result);
            }
            ControlMessage::Retry { demote, reply } => {
                let views = self.candidates();
                let result = match self.orchestrator.retry(&demote, &views, now) {
                    Ok(step) => {
                        self.apply(step).await;
                        self.current_view()
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            ControlMessage::CurrentSession { reply } => {
                let _ = reply.send(Ok(self.orchestrator.view()));
            }
            ControlMessage::Reports { reply } => {
                let _ = reply.send(Ok(self.orchestrator.reports().cloned().collect()));
            }
        }
    }

    fn on_hello(&mut self, hello: HelloPayload, peer: Option<String>) -> HelloDecision {
        let device = hello.device_id.clone();
        if hello.protocol_version != PROTOCOL_VERSION {
            warn!(
                device_id = %device,
                "rejecting protocol version {} (want {})",
                hello.protocol_version,
                PROTOCOL_VERSION
            );
            return HelloDecision::Rejected {
                reason: format!(
                    "protocol version {} not supported, expected {}",
                    hello.protocol_version, PROTOCOL_VERSION
                ),
            };
        }

        let registration =
            self.registry
                .register(&device, hello.capabilities.iter().cloned(), hello.protocol_version);
        self.registry.describe(&device, hello.device_name.clone(), peer);

        self.next_connection_id += 1;
        let connection_id = self.next_connection_id;
        let cancel = self.shutdown.child_token();
        if let Some(old) = self.links.insert(
            device.clone(),
            Link {
                connection_id,
                cancel: cancel.clone(),
            },
        ) {
            info!(device_id = %device, "new connection supersedes #{}", old.connection_id);
            old.cancel.cancel();
        }

        let capacity = self.config.connection.outbound_capacity;
        let outbox = self
            .outboxes
            .entry(device.clone())
            .or_insert_with(|| Arc::new(DeviceOutbox::new(device.clone(), capacity)))
            .clone();

        if registration != Registration::New {
            let discarded = outbox.reconnected(self.config.connection.command_ttl());
            if !discarded.is_empty() {
                self.orchestrator.record_discarded(&device, &discarded);
            }
        }

        HelloDecision::Accepted {
            outbox,
            cancel,
            connection_id,
        }
    }

    fn on_sync(&mut self, device: &DeviceId, snapshot: SyncSnapshot) {
        let previous = self.registry.record_sync(device, snapshot.clone());
        if let Some(previous) = previous {
            if snapshot.status.is_downgrade_from(previous) {
                let err = TuttiError::ClockQuality {
                    device: device.clone(),
                    status: snapshot.status.as_str(),
                    rms_us: snapshot.rms_us,
                    threshold_us: self.config.sync.rms_threshold_us,
                };
                warn!(device_id = %device, "{}", err);
            }
        }
        self.orchestrator.record_sync(device, &snapshot);
    }

    fn is_current(&self, device: &DeviceId, connection_id: u64) -> bool {
        self.links
            .get(device)
            .is_some_and(|l| l.connection_id == connection_id)
    }

    fn candidates(&self) -> Vec<DeviceView> {
        self.registry
            .active()
            .iter()
            .map(DeviceView::from)
            .collect()
    }

    fn current_view(&self) -> Result<SessionView> {
        self.orchestrator
            .view()
            .ok_or_else(|| SessionError::NoActiveSession.into())
    }

    async fn settle(&mut self, result: std::result::Result<Step, SessionError>) {
        match result {
            Ok(step) => self.apply(step).await,
            Err(e) => error!("rejected session transition: {}", e),
        }
    }

    /// Carry out an orchestrator step: queue commands, answer waiters,
    /// archive the report and re-arm the deadline.
    async fn apply(&mut self, mut step: Step) {
        if let Some(report) = &step.finished {
            let session_id = report.session_id.as_str();
            for outbox in self.outboxes.values() {
                // Aborted sessions lose queued commands too; a finished
                // session only drops what is still waiting for an ack.
                let purged = if report.outcome == Outcome::Aborted {
                    outbox.purge_session(session_id)
                } else {
                    outbox.forget_in_flight(session_id)
                };
                if purged > 0 {
                    debug!(device_id = %outbox.device_id(), "purged {} command(s) of {}", purged, session_id);
                }
            }
        }

        for (device, command) in std::mem::take(&mut step.commands) {
            if let Some(session_id) = &command.session_id {
                self.registry.note_session(&device, session_id);
            }
            let Some(outbox) = self.outboxes.get(&device) else {
                warn!(device_id = %device, "no outbox, dropping {}", command.command_name);
                continue;
            };
            let command_id = command.command_id;
            if outbox.push(Body::Command(command)) == PushOutcome::Dropped {
                error!(device_id = %device, command_id, "command dropped by outbound queue");
            }
        }

        if step.entered(SessionState::Recording) {
            if let Some(session) = self.orchestrator.view() {
                for waiter in self.start_waiters.drain(..) {
                    let _ = waiter.send(Ok(StartOutcome::Recording {
                        session: session.clone(),
                    }));
                }
            }
        }

        if let Some(report) = step.finished {
            match report.persist(&self.report_dir).await {
                Ok(path) => info!(session_id = %report.session_id, "report written to {}", path.display()),
                Err(e) => error!(session_id = %report.session_id, "failed to write report: {:#}", e),
            }
            for waiter in self.start_waiters.drain(..) {
                let _ = waiter.send(Ok(StartOutcome::Aborted {
                    report: report.clone(),
                }));
            }
            for waiter in self.stop_waiters.drain(..) {
                let _ = waiter.send(Ok(report.clone()));
            }
        }

        self.rearm();
    }

    fn rearm(&mut self) {
        let wanted = self.orchestrator.deadline();
        let unchanged = match (&self.deadline, &wanted) {
            (Some(armed), Some((session_id, kind))) => {
                &armed.session_id == session_id && armed.kind == *kind
            }
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return;
        }

        self.resend = match &wanted {
            Some(_) if self.command_retry.max_attempts > 0 => Some(Resend {
                attempt: 1,
                at: Instant::now() + self.command_retry.backoff_for_attempt(1),
            }),
            _ => None,
        };
        self.deadline = wanted.map(|(session_id, kind)| {
            let timeout = match kind {
                DeadlineKind::Start => self.orchestrator.config().start_timeout(),
                DeadlineKind::Stop => self.orchestrator.config().stop_timeout(),
            };
            debug!(session_id = %session_id, "{:?} deadline in {:?}", kind, timeout);
            Armed {
                session_id,
                kind,
                at: Instant::now() + timeout,
            }
        });
    }

    async fn deadline_elapsed(&mut self) {
        let Some(armed) = self.deadline.take() else {
            return;
        };
        let now = unix_nanos();
        warn!(session_id = %armed.session_id, "{:?} deadline elapsed", armed.kind);
        let result = match armed.kind {
            DeadlineKind::Start => self.orchestrator.start_deadline_elapsed(&armed.session_id, now),
            DeadlineKind::Stop => self.orchestrator.stop_deadline_elapsed(&armed.session_id, now),
        };
        self.settle(result).await;
    }

    /// Re-send unacked start/stop commands on the retry schedule; once the
    /// attempts are used up, flag whoever is still silent as unresponsive.
    async fn resend_elapsed(&mut self) {
        let Some(resend) = self.resend.take() else {
            return;
        };
        let made = resend.attempt - 1;
        if !self.command_retry.should_retry(made) {
            let silent = self.orchestrator.mark_unresponsive();
            if !silent.is_empty() {
                let err = TuttiError::Timeout(format!("ack after {} re-send(s)", made));
                warn!(devices = ?silent, "{}", err);
            }
            return;
        }

        let step = self.orchestrator.resend_unacked();
        if step.commands.is_empty() {
            return;
        }
        self.apply(step).await;
        let next = resend.attempt + 1;
        self.resend = Some(Resend {
            attempt: next,
            at: Instant::now() + self.command_retry.backoff_for_attempt(next),
        });
    }

    fn sweep(&self) {
        let swept = self.registry.sweep(
            std::time::Instant::now(),
            self.config.connection.heartbeat_timeout(),
        );
        if !swept.is_empty() {
            debug!("swept {} silent device(s) to stale", swept.len());
        }
    }

    fn log_stats(&self) {
        let summary = self.registry.summary();
        info!(
            active = summary.active,
            stale = summary.stale,
            disconnected = summary.disconnected,
            "📊 devices: {} active, {} stale, {} disconnected; session {}",
            summary.active,
            summary.stale,
            summary.disconnected,
            self.orchestrator.state()
        );
    }
}

fn command_retry_policy(config: &CoordinationConfig) -> RetryPolicy {
    let session = &config.session;
    RetryPolicy::default()
        .with_max_attempts(session.command_retries)
        .with_backoff(session.command_retry_base(), session.command_retry_max())
}

async fn sleep_until_armed(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => future::pending().await,
    }
}

/// Spawn the controller on the current runtime.
pub fn spawn(
    config: &TuttiConfig,
    registry: Arc<DeviceRegistry>,
    shutdown: CancellationToken,
) -> ControllerHandle {
    let (controller, handle) = Controller::new(config, registry, shutdown);
    tokio::spawn(controller.run());
    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use tuttiproto::Capability;

    struct Harness {
        handle: ControllerHandle,
        _reports: tempfile::TempDir,
        shutdown: CancellationToken,
    }

    fn harness() -> Harness {
        let reports = tempfile::tempdir().unwrap();
        let mut config = TuttiConfig::default();
        config.infra.paths.report_dir = reports.path().to_path_buf();
        let shutdown = CancellationToken::new();
        let handle = spawn(&config, Arc::new(DeviceRegistry::new()), shutdown.clone());
        Harness {
            handle,
            _reports: reports,
            shutdown,
        }
    }

    fn hello(id: &str, caps: &[Capability]) -> HelloPayload {
        HelloPayload {
            device_id: DeviceId::from(id),
            capabilities: caps.to_vec(),
            protocol_version: PROTOCOL_VERSION,
            device_name: None,
        }
    }

    /// Register and activate a device the way a connection handler would.
    async fn join(handle: &ControllerHandle, id: &str, caps: &[Capability]) -> (Arc<DeviceOutbox>, u64) {
        match handle.hello(hello(id, caps), None).await.unwrap() {
            HelloDecision::Accepted {
                outbox,
                connection_id,
                ..
            } => {
                handle
                    .notify(ControlMessage::Activated {
                        device: DeviceId::from(id),
                        connection_id,
                    })
                    .await;
                (outbox, connection_id)
            }
            HelloDecision::Rejected { reason } => panic!("rejected: {}", reason),
        }
    }

    fn next_command(outbox: &DeviceOutbox) -> tuttiproto::CommandPayload {
        loop {
            match outbox.pop() {
                Some(Body::Command(command)) => return command,
                Some(_) => continue,
                None => panic!("no command queued for {}", outbox.device_id()),
            }
        }
    }

    fn ack_for(command: &tuttiproto::CommandPayload) -> AckPayload {
        let mut ack = AckPayload::ok(command.command_id);
        ack.session_id = command.session_id.clone();
        ack
    }

    #[tokio::test]
    async fn rejects_wrong_protocol_version() {
        let h = harness();
        let mut old = hello("cam", &[Capability::Camera]);
        old.protocol_version = PROTOCOL_VERSION + 1;
        let decision = h.handle.hello(old, None).await.unwrap();
        assert!(matches!(decision, HelloDecision::Rejected { .. }));
        assert!(h.handle.registry().is_empty());
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn newer_connection_supersedes_older() {
        let h = harness();
        let first = h.handle.hello(hello("cam", &[Capability::Camera]), None).await.unwrap();
        let HelloDecision::Accepted { cancel: first_cancel, connection_id: first_id, .. } = first else {
            panic!("first hello rejected");
        };
        let (_outbox, second_id) = join(&h.handle, "cam", &[Capability::Camera]).await;
        assert!(first_cancel.is_cancelled());
        assert_ne!(first_id, second_id);

        // The old handler's goodbye must not mark the device disconnected
        h.handle
            .notify(ControlMessage::Disconnected {
                device: DeviceId::from("cam"),
                connection_id: first_id,
                reason: "superseded".into(),
            })
            .await;
        h.handle.current_session().await.unwrap();
        let record = h.handle.registry().lookup(&DeviceId::from("cam")).unwrap();
        assert_eq!(record.state, crate::registry::ConnectionState::Active);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn start_waits_for_required_ack() {
        let h = harness();
        let (cam, _) = join(&h.handle, "cam", &[Capability::Camera]).await;
        let (gsr, _) = join(&h.handle, "camgsr", &[Capability::Camera, Capability::Gsr]).await;

        let view = h
            .handle
            .create_session(SessionRequest::for_capabilities([Capability::Camera, Capability::Gsr]))
            .await
            .unwrap();
        assert_eq!(view.state, SessionState::Configuring);
        assert_eq!(next_command(&cam).command_name, "configure");
        assert_eq!(next_command(&gsr).command_name, "configure");

        let starter = {
            let handle = h.handle.clone();
            tokio::spawn(async move { handle.start_session().await })
        };
        // Let the start broadcast land
        let start = loop {
            if let Some(Body::Command(command)) = gsr.pop() {
                break command;
            }
            tokio::task::yield_now().await;
        };
        assert_eq!(start.command_name, "start");

        h.handle
            .notify(ControlMessage::Ack {
                device: DeviceId::from("camgsr"),
                ack: ack_for(&start),
            })
            .await;
        let outcome = starter.await.unwrap().unwrap();
        let StartOutcome::Recording { session } = outcome else {
            panic!("expected recording");
        };
        assert_eq!(session.state, SessionState::Recording);
        h.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn start_deadline_aborts_and_writes_report() {
        let reports = tempfile::tempdir().unwrap();
        let mut config = TuttiConfig::default();
        config.infra.paths.report_dir = reports.path().to_path_buf();
        let shutdown = CancellationToken::new();
        let handle = spawn(&config, Arc::new(DeviceRegistry::new()), shutdown.clone());

        join(&handle, "cam", &[Capability::Camera]).await;
        handle
            .create_session(SessionRequest::for_capabilities([Capability::Camera]))
            .await
            .unwrap();

        let outcome = handle.start_session().await.unwrap();
        let StartOutcome::Aborted { report } = outcome else {
            panic!("expected abort");
        };
        assert_eq!(report.outcome, Outcome::Aborted);
        assert_eq!(
            report.abort.as_ref().unwrap().non_responding,
            vec![DeviceId::from("cam")]
        );
        assert!(reports
            .path()
            .join(format!("{}.json", report.session_id))
            .exists());
        assert_eq!(handle.reports().await.unwrap().len(), 1);
        assert!(handle.current_session().await.unwrap().is_none());
        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn finished_session_clears_unacked_in_flight() {
        let h = harness();
        let (cam, _) = join(&h.handle, "cam", &[Capability::Camera]).await;
        h.handle
            .create_session(SessionRequest::for_capabilities([Capability::Camera]))
            .await
            .unwrap();
        assert_eq!(next_command(&cam).command_name, "configure");

        let starter = {
            let handle = h.handle.clone();
            tokio::spawn(async move { handle.start_session().await })
        };
        let start = loop {
            if let Some(Body::Command(command)) = cam.pop() {
                break command;
            }
            tokio::task::yield_now().await;
        };
        h.handle
            .notify(ControlMessage::Ack {
                device: DeviceId::from("cam"),
                ack: ack_for(&start),
            })
            .await;
        assert!(matches!(
            starter.await.unwrap().unwrap(),
            StartOutcome::Recording { .. }
        ));

        let stopper = {
            let handle = h.handle.clone();
            tokio::spawn(async move { handle.stop_session().await })
        };
        let stop = loop {
            if let Some(Body::Command(command)) = cam.pop() {
                break command;
            }
            tokio::task::yield_now().await;
        };
        assert_eq!(stop.command_name, "stop");
        assert!(cam.stats().in_flight > 0);

        // The stop is never acked: re-sent, given up on, then finalized partial
        let report = stopper.await.unwrap().unwrap();
        assert_eq!(report.outcome, Outcome::Partial);
        let device = report.device(&DeviceId::from("cam")).unwrap();
        assert!(device.unresponsive);
        assert_eq!(device.resends, 2);
        assert_eq!(cam.stats().in_flight, 0);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn operator_errors_surface_as_consistency() {
        let h = harness();
        let err = h.handle.stop_session().await.unwrap_err();
        assert!(matches!(
            err,
            TuttiError::Consistency(SessionError::NoActiveSession)
        ));
        let err = h
            .handle
            .create_session(SessionRequest::for_capabilities([Capability::Thermal]))
            .await
            .unwrap_err();
        assert!(matches!(err, TuttiError::NoEligibleDevices { .. }));
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn stopped_controller_is_unavailable() {
        let h = harness();
        h.shutdown.cancel();
        // The run loop exits and drops the receiver
        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = h.handle.current_session().await.unwrap_err();
        assert!(matches!(err, TuttiError::ControllerUnavailable));
    }
}
