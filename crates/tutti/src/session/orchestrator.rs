//! Session state machine.
//!
//! Pure logic: every operation takes the current reference time and returns
//! the commands to send. The controller owns the single instance, feeds it
//! device events in arrival order, and arms the start/stop deadlines it asks
//! for. Nothing here touches the network or a clock.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, info, warn};
use tutticonf::{LossPolicy, SessionConfig};
use tuttiproto::timing::{duration_to_nanos, nanos_to_millis_f64};
use tuttiproto::{AckPayload, Capability, CommandId, CommandPayload, DeviceId};

use super::report::{
    utc, AbortReason, AbortSummary, AckSummary, DeviceReport, Exclusion, ExclusionReason,
    Outcome, SessionReport, StateChange, TimingConfidence,
};
use super::{Role, SessionError, SessionId, SessionRequest, SessionState};
use crate::clock::{SyncSnapshot, SyncStatus};
use crate::error::{Result, TuttiError};
use crate::registry::DeviceRecord;

/// What the orchestrator knows about a candidate device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceView {
    pub id: DeviceId,
    pub capabilities: BTreeSet<Capability>,
    pub sync: Option<SyncSnapshot>,
}

impl DeviceView {
    pub fn new(id: impl Into<DeviceId>, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            id: id.into(),
            capabilities: capabilities.into_iter().collect(),
            sync: None,
        }
    }

    pub fn with_sync(mut self, sync: SyncSnapshot) -> Self {
        self.sync = Some(sync);
        self
    }

    fn sync_status(&self) -> Option<SyncStatus> {
        self.sync.as_ref().map(|s| s.status)
    }
}

impl From<&DeviceRecord> for DeviceView {
    fn from(record: &DeviceRecord) -> Self {
        Self {
            id: record.id.clone(),
            capabilities: record.capabilities.clone(),
            sync: record.sync.clone(),
        }
    }
}

/// Output of one orchestrator operation.
#[derive(Debug, Default)]
pub struct Step {
    /// Commands to enqueue, in order
    pub commands: Vec<(DeviceId, CommandPayload)>,
    /// States entered during the operation
    pub entered: Vec<SessionState>,
    /// Set when the session left the active slot
    pub finished: Option<SessionReport>,
}

impl Step {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.entered.is_empty() && self.finished.is_none()
    }

    pub fn entered(&self, state: SessionState) -> bool {
        self.entered.contains(&state)
    }
}

/// Which bounded wait the controller must arm for the active session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlineKind {
    Start,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParticipantView {
    pub device_id: DeviceId,
    pub role: Role,
    pub demoted: bool,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configured: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped: Option<bool>,
    pub timing_confidence: TimingConfidence,
}

/// Operator-facing snapshot of the active session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    pub session_id: SessionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<SessionId>,
    pub state: SessionState,
    pub requested_capabilities: Vec<Capability>,
    pub participants: Vec<ParticipantView>,
    pub excluded: Vec<Exclusion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_command_id: Option<CommandId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_at_reference_ns: Option<i64>,
    pub partial: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Configure,
    Start,
    Stop,
    Abort,
}

impl Phase {
    fn command_name(&self) -> &'static str {
        match self {
            Phase::Configure => "configure",
            Phase::Start => "start",
            Phase::Stop => "stop",
            Phase::Abort => "abort",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Issued {
    id: CommandId,
    at: i64,
}

#[derive(Debug, Clone)]
struct Participant {
    role: Role,
    demoted: bool,
    connected: bool,
    configure: Option<AckSummary>,
    start: Option<AckSummary>,
    stop: Option<AckSummary>,
    sync: Option<SyncSnapshot>,
    /// Worst downgrade seen while the session ran
    flagged: Option<SyncStatus>,
    disconnected_at: Option<i64>,
    discarded: Vec<CommandId>,
    /// Last start or stop sent, kept for re-sending until acked
    outstanding: Option<CommandPayload>,
    resends: u32,
    unresponsive: bool,
}

impl Participant {
    fn new(role: Role, sync: Option<SyncSnapshot>) -> Self {
        Self {
            role,
            demoted: false,
            connected: true,
            configure: None,
            start: None,
            stop: None,
            sync,
            flagged: None,
            disconnected_at: None,
            discarded: Vec::new(),
            outstanding: None,
            resends: 0,
            unresponsive: false,
        }
    }

    fn is_required(&self) -> bool {
        self.role == Role::Required
    }

    fn started_ok(&self) -> bool {
        self.start.as_ref().is_some_and(|a| a.success)
    }

    /// The start/stop command this participant still owes an ack for.
    fn awaiting(&self, state: SessionState) -> Option<&CommandPayload> {
        let answered = match state {
            SessionState::Starting => self.start.is_some(),
            SessionState::Stopping => self.stop.is_some(),
            _ => return None,
        };
        if answered || !self.connected || self.unresponsive {
            return None;
        }
        self.outstanding.as_ref()
    }

    fn ack_slot(&mut self, phase: Phase) -> Option<&mut Option<AckSummary>> {
        match phase {
            Phase::Configure => Some(&mut self.configure),
            Phase::Start => Some(&mut self.start),
            Phase::Stop => Some(&mut self.stop),
            Phase::Abort => None,
        }
    }

    fn timing_confidence(&self) -> TimingConfidence {
        let current = self.sync.as_ref().map(|s| s.status);
        match (current, self.flagged) {
            (_, Some(SyncStatus::Unsynchronized)) | (Some(SyncStatus::Unsynchronized), _) => {
                TimingConfidence::Unsynchronized
            }
            (_, Some(SyncStatus::Degraded)) | (Some(SyncStatus::Degraded), _) => {
                TimingConfidence::Degraded
            }
            (current, _) => TimingConfidence::from(current),
        }
    }
}

#[derive(Debug)]
struct Session {
    id: SessionId,
    retry_of: Option<SessionId>,
    request: SessionRequest,
    state: SessionState,
    participants: BTreeMap<DeviceId, Participant>,
    excluded: Vec<Exclusion>,
    created_at: i64,
    started_at: Option<i64>,
    stopped_at: Option<i64>,
    configure: Option<Issued>,
    start: Option<Issued>,
    stop: Option<Issued>,
    abort: Option<Issued>,
    start_at_reference: Option<i64>,
    partial: bool,
    history: Vec<StateChange>,
}

impl Session {
    fn new(request: SessionRequest, retry_of: Option<SessionId>, now: i64) -> Self {
        Self {
            id: SessionId::generate(),
            retry_of,
            request,
            state: SessionState::Idle,
            participants: BTreeMap::new(),
            excluded: Vec::new(),
            created_at: now,
            started_at: None,
            stopped_at: None,
            configure: None,
            start: None,
            stop: None,
            abort: None,
            start_at_reference: None,
            partial: false,
            history: vec![StateChange {
                state: SessionState::Idle,
                at: utc(now),
            }],
        }
    }

    fn transition(
        &mut self,
        to: SessionState,
        now: i64,
        step: &mut Step,
    ) -> std::result::Result<(), SessionError> {
        if !self.state.can_transition_to(to) {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        info!(session_id = %self.id, "session {} -> {}", self.state, to);
        self.state = to;
        self.history.push(StateChange { state: to, at: utc(now) });
        step.entered.push(to);
        Ok(())
    }

    fn phase_of(&self, command_id: CommandId) -> Option<(Phase, i64)> {
        [
            (Phase::Configure, self.configure),
            (Phase::Start, self.start),
            (Phase::Stop, self.stop),
            (Phase::Abort, self.abort),
        ]
        .into_iter()
        .find_map(|(phase, issued)| {
            issued
                .filter(|i| i.id == command_id)
                .map(|i| (phase, i.at))
        })
    }

    fn required_count(&self) -> usize {
        self.participants.values().filter(|p| p.is_required()).count()
    }

    /// Every required participant acked the start command successfully.
    fn start_complete(&self) -> bool {
        self.required_count() > 0
            && self
                .participants
                .values()
                .filter(|p| p.is_required())
                .all(Participant::started_ok)
    }

    /// Every participant still connected has answered the stop command.
    fn stop_settled(&self) -> bool {
        self.participants
            .values()
            .filter(|p| p.connected)
            .all(|p| p.stop.is_some())
    }

    fn connected_ids(&self) -> Vec<DeviceId> {
        self.participants
            .iter()
            .filter(|(_, p)| p.connected)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn abort_summary(&self, reason: AbortReason, state_at_abort: SessionState) -> AbortSummary {
        let mut summary = AbortSummary {
            reason,
            state_at_abort,
            responding: Vec::new(),
            non_responding: Vec::new(),
            missing_required: Vec::new(),
            failed: Vec::new(),
        };
        for (id, p) in &self.participants {
            match &p.start {
                Some(ack) => {
                    summary.responding.push(id.clone());
                    if !ack.success {
                        summary.failed.push(id.clone());
                    }
                }
                None => {
                    summary.non_responding.push(id.clone());
                    if p.is_required() {
                        summary.missing_required.push(id.clone());
                    }
                }
            }
        }
        summary
    }

    fn report(
        &self,
        outcome: Outcome,
        abort: Option<AbortSummary>,
        stop_non_responding: Vec<DeviceId>,
        now: i64,
    ) -> SessionReport {
        let devices = self
            .participants
            .iter()
            .map(|(id, p)| DeviceReport {
                device_id: id.clone(),
                role: p.role,
                demoted: p.demoted,
                configure: p.configure.clone(),
                start: p.start.clone(),
                stop: p.stop.clone(),
                sync: p.sync.clone(),
                timing_confidence: p.timing_confidence(),
                disconnected_at: p.disconnected_at.map(utc),
                discarded_commands: p.discarded.clone(),
                resends: p.resends,
                unresponsive: p.unresponsive,
            })
            .collect();

        SessionReport {
            session_id: self.id.clone(),
            label: self.request.label.clone(),
            retry_of: self.retry_of.clone(),
            outcome,
            requested_capabilities: self.request.capabilities.clone(),
            created_at: utc(self.created_at),
            started_at: self.started_at.map(utc),
            stopped_at: self.stopped_at.map(utc),
            finished_at: utc(now),
            start_command_id: self.start.map(|i| i.id),
            start_at_reference_ns: self.start_at_reference,
            stop_command_id: self.stop.map(|i| i.id),
            devices,
            excluded: self.excluded.clone(),
            abort,
            stop_non_responding,
            history: self.history.clone(),
        }
    }

    fn view(&self) -> SessionView {
        SessionView {
            session_id: self.id.clone(),
            label: self.request.label.clone(),
            retry_of: self.retry_of.clone(),
            state: self.state,
            requested_capabilities: self.request.capabilities.clone(),
            participants: self
                .participants
                .iter()
                .map(|(id, p)| ParticipantView {
                    device_id: id.clone(),
                    role: p.role,
                    demoted: p.demoted,
                    connected: p.connected,
                    configured: p.configure.as_ref().map(|a| a.success),
                    started: p.start.as_ref().map(|a| a.success),
                    stopped: p.stop.as_ref().map(|a| a.success),
                    timing_confidence: p.timing_confidence(),
                })
                .collect(),
            excluded: self.excluded.clone(),
            start_command_id: self.start.map(|i| i.id),
            start_at_reference_ns: self.start_at_reference,
            partial: self.partial,
        }
    }
}

/// Participants and roles of an aborted session, kept for `retry`.
#[derive(Debug, Clone)]
struct RetryTemplate {
    session_id: SessionId,
    request: SessionRequest,
    roles: Vec<(DeviceId, Role, bool)>,
}

fn allocate(counter: &mut CommandId) -> CommandId {
    *counter += 1;
    *counter
}

fn ack_summary(ack: &AckPayload, issued_at: i64, now: i64) -> AckSummary {
    AckSummary {
        command_id: ack.command_id,
        success: ack.success,
        error_detail: ack.error_detail.clone(),
        latency_ms: nanos_to_millis_f64((now - issued_at).max(0)),
    }
}

/// The single-session state machine.
#[derive(Debug)]
pub struct Orchestrator {
    config: SessionConfig,
    active: Option<Session>,
    last_aborted: Option<RetryTemplate>,
    history: VecDeque<SessionReport>,
    /// Monotonic across sessions, so ids also increase within each one
    next_command_id: CommandId,
}

impl Orchestrator {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            active: None,
            last_aborted: None,
            history: VecDeque::new(),
            next_command_id: 0,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.active
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(SessionState::Idle)
    }

    pub fn active_id(&self) -> Option<&SessionId> {
        self.active.as_ref().map(|s| &s.id)
    }

    pub fn view(&self) -> Option<SessionView> {
        self.active.as_ref().map(Session::view)
    }

    /// Archived reports, oldest first.
    pub fn reports(&self) -> impl Iterator<Item = &SessionReport> {
        self.history.iter()
    }

    pub fn report(&self, id: &SessionId) -> Option<&SessionReport> {
        self.history.iter().find(|r| &r.session_id == id)
    }

    pub fn is_participant(&self, device: &DeviceId) -> bool {
        self.active
            .as_ref()
            .is_some_and(|s| s.participants.contains_key(device))
    }

    /// The bounded wait the active session is in, if any.
    pub fn deadline(&self) -> Option<(SessionId, DeadlineKind)> {
        let session = self.active.as_ref()?;
        match session.state {
            SessionState::Starting => Some((session.id.clone(), DeadlineKind::Start)),
            SessionState::Stopping => Some((session.id.clone(), DeadlineKind::Stop)),
            _ => None,
        }
    }

    /// Fix the participant list and distribute `configure`.
    ///
    /// Devices providing every requested capability are required, devices
    /// sharing at least one are optional. Unsynchronized devices are left out.
    pub fn configure(
        &mut self,
        request: SessionRequest,
        devices: &[DeviceView],
        now: i64,
    ) -> Result<Step> {
        if let Some(active) = &self.active {
            return Err(SessionError::AlreadyActive(active.id.clone()).into());
        }
        if request.capabilities.is_empty() {
            return Err(SessionError::EmptyRequest.into());
        }

        let requested: BTreeSet<&Capability> = request.capabilities.iter().collect();
        let mut session = Session::new(request.clone(), None, now);
        let mut unsynchronized = Vec::new();

        for device in devices {
            let matching = requested
                .iter()
                .filter(|c| device.capabilities.contains(*c))
                .count();
            if matching == 0 {
                session.excluded.push(Exclusion {
                    device_id: device.id.clone(),
                    reason: ExclusionReason::NoMatchingCapability,
                });
                continue;
            }
            if device.sync_status() == Some(SyncStatus::Unsynchronized) {
                unsynchronized.push(device.id.clone());
                session.excluded.push(Exclusion {
                    device_id: device.id.clone(),
                    reason: ExclusionReason::Unsynchronized,
                });
                continue;
            }
            let role = if matching == requested.len() {
                Role::Required
            } else {
                Role::Optional
            };
            session
                .participants
                .insert(device.id.clone(), Participant::new(role, device.sync.clone()));
        }

        if session.required_count() == 0 {
            warn!(
                "no device provides all of {:?} ({} unsynchronized)",
                request.capabilities,
                unsynchronized.len()
            );
            return Err(TuttiError::NoEligibleDevices {
                requested: request.capabilities,
                unsynchronized,
            });
        }

        let step = self.begin(session, now)?;
        Ok(step)
    }

    /// Retry the last aborted session with the same participants, demoting
    /// the listed devices. Participants no longer connected are excluded.
    pub fn retry(&mut self, demote: &[DeviceId], devices: &[DeviceView], now: i64) -> Result<Step> {
        if let Some(active) = &self.active {
            return Err(SessionError::AlreadyActive(active.id.clone()).into());
        }
        let template = self
            .last_aborted
            .clone()
            .ok_or(SessionError::NothingToRetry)?;

        if let Some(stranger) = demote
            .iter()
            .find(|id| !template.roles.iter().any(|(d, _, _)| d == *id))
        {
            return Err(SessionError::NotParticipant(stranger.clone()).into());
        }

        let mut session = Session::new(template.request.clone(), Some(template.session_id.clone()), now);
        for (id, role, demoted) in &template.roles {
            let Some(view) = devices.iter().find(|v| &v.id == id) else {
                session.excluded.push(Exclusion {
                    device_id: id.clone(),
                    reason: ExclusionReason::NotConnected,
                });
                continue;
            };
            if view.sync_status() == Some(SyncStatus::Unsynchronized) {
                session.excluded.push(Exclusion {
                    device_id: id.clone(),
                    reason: ExclusionReason::Unsynchronized,
                });
                continue;
            }
            let mut participant = Participant::new(*role, view.sync.clone());
            participant.demoted = *demoted;
            if demote.contains(id) && participant.is_required() {
                participant.role = Role::Optional;
                participant.demoted = true;
            }
            session.participants.insert(id.clone(), participant);
        }

        if session.required_count() == 0 {
            return Err(TuttiError::NoEligibleDevices {
                requested: template.request.capabilities,
                unsynchronized: session
                    .excluded
                    .iter()
                    .filter(|e| e.reason == ExclusionReason::Unsynchronized)
                    .map(|e| e.device_id.clone())
                    .collect(),
            });
        }

        info!(session_id = %session.id, "retrying aborted session {}", template.session_id);
        let step = self.begin(session, now)?;
        self.last_aborted = None;
        Ok(step)
    }

    fn begin(&mut self, mut session: Session, now: i64) -> std::result::Result<Step, SessionError> {
        let mut step = Step::default();
        session.transition(SessionState::Configuring, now, &mut step)?;

        let id = allocate(&mut self.next_command_id);
        session.configure = Some(Issued { id, at: now });
        for (device, p) in &session.participants {
            let mut command = CommandPayload::new(id, Phase::Configure.command_name())
                .with_session(session.id.as_str());
            command.parameters = session.request.parameters.clone();
            command = command.with_param("role", p.role.as_str());
            if let Some(label) = &session.request.label {
                command = command.with_param("label", label.as_str());
            }
            step.commands.push((device.clone(), command));
        }

        info!(
            session_id = %session.id,
            "configured {} participant(s) ({} required), {} excluded",
            session.participants.len(),
            session.required_count(),
            session.excluded.len()
        );
        self.active = Some(session);
        Ok(step)
    }

    /// Broadcast one `start` command to every participant.
    ///
    /// Each device gets the shared reference start time plus that time mapped
    /// onto its own clock.
    pub fn start(&mut self, devices: &[DeviceView], now: i64) -> std::result::Result<Step, SessionError> {
        let session = self.active.as_mut().ok_or(SessionError::NoActiveSession)?;
        if session.state != SessionState::Configuring {
            return Err(SessionError::NotAllowed {
                op: "start",
                state: session.state,
            });
        }

        let mut step = Step::default();
        session.transition(SessionState::Starting, now, &mut step)?;

        let id = allocate(&mut self.next_command_id);
        let start_at = now + duration_to_nanos(self.config.start_lead());
        session.start = Some(Issued { id, at: now });
        session.start_at_reference = Some(start_at);

        for (device, p) in session.participants.iter_mut() {
            if let Some(view) = devices.iter().find(|v| &v.id == device) {
                if view.sync.is_some() {
                    p.sync = view.sync.clone();
                }
            }
            if !p.connected {
                continue;
            }
            let mut command = CommandPayload::new(id, Phase::Start.command_name())
                .with_session(session.id.as_str())
                .with_param("role", p.role.as_str())
                .with_param("startAtReference", start_at);
            if let Some(sync) = &p.sync {
                command = command.with_param("startAtDevice", sync.to_device(start_at));
            }
            p.outstanding = Some(command.clone());
            step.commands.push((device.clone(), command));
        }

        info!(
            session_id = %session.id,
            command_id = id,
            "start broadcast to {} device(s)",
            step.commands.len()
        );
        Ok(step)
    }

    pub fn record_ack(
        &mut self,
        device: &DeviceId,
        ack: &AckPayload,
        now: i64,
    ) -> std::result::Result<Step, SessionError> {
        let mut step = Step::default();
        let Some(session) = self.active.as_mut() else {
            debug!(device_id = %device, command_id = ack.command_id, "ack with no active session");
            return Ok(step);
        };
        if ack
            .session_id
            .as_deref()
            .is_some_and(|s| s != session.id.as_str())
        {
            debug!(device_id = %device, command_id = ack.command_id, "ack for another session");
            return Ok(step);
        }
        let Some((phase, issued_at)) = session.phase_of(ack.command_id) else {
            debug!(device_id = %device, command_id = ack.command_id, "ack for unknown command");
            return Ok(step);
        };
        let state = session.state;
        let session_id = session.id.clone();
        let Some(participant) = session.participants.get_mut(device) else {
            debug!(device_id = %device, "ack from non-participant");
            return Ok(step);
        };
        let required = participant.is_required();
        let Some(slot) = participant.ack_slot(phase) else {
            return Ok(step);
        };
        if slot.is_some() {
            debug!(device_id = %device, command_id = ack.command_id, "duplicate ack ignored");
            return Ok(step);
        }
        let summary = ack_summary(ack, issued_at, now);
        debug!(
            session_id = %session_id,
            device_id = %device,
            command_id = ack.command_id,
            success = ack.success,
            "{} ack after {:.1}ms",
            phase.command_name(),
            summary.latency_ms
        );
        *slot = Some(summary);

        if !ack.success {
            warn!(
                session_id = %session_id,
                device_id = %device,
                "{} rejected: {}",
                phase.command_name(),
                ack.error_detail.as_deref().unwrap_or("no detail")
            );
        }

        match phase {
            Phase::Configure | Phase::Start
                if !ack.success
                    && required
                    && matches!(state, SessionState::Configuring | SessionState::Starting) =>
            {
                let reason = AbortReason::RequiredRejected {
                    device: device.clone(),
                    command: phase.command_name().to_string(),
                    detail: ack.error_detail.clone(),
                };
                self.abort_active(reason, now, &mut step)?;
            }
            Phase::Start if state == SessionState::Starting => {
                self.check_started(now, &mut step)?;
            }
            Phase::Stop if state == SessionState::Stopping => {
                self.check_stopped(now, &mut step)?;
            }
            _ => {}
        }
        Ok(step)
    }

    fn check_started(&mut self, now: i64, step: &mut Step) -> std::result::Result<(), SessionError> {
        let Some(session) = self.active.as_mut() else {
            return Ok(());
        };
        if session.state == SessionState::Starting && session.start_complete() {
            session.transition(SessionState::Recording, now, step)?;
            session.started_at = Some(now);
        }
        Ok(())
    }

    fn check_stopped(&mut self, now: i64, step: &mut Step) -> std::result::Result<(), SessionError> {
        let settled = self
            .active
            .as_ref()
            .is_some_and(|s| s.state == SessionState::Stopping && s.stop_settled());
        if settled {
            self.finalize(now, step)?;
        }
        Ok(())
    }

    /// The start wait ran out. Aborts if the session is still starting.
    pub fn start_deadline_elapsed(
        &mut self,
        session_id: &SessionId,
        now: i64,
    ) -> std::result::Result<Step, SessionError> {
        let mut step = Step::default();
        let starting = self
            .active
            .as_ref()
            .is_some_and(|s| &s.id == session_id && s.state == SessionState::Starting);
        if starting {
            let reason = AbortReason::StartTimeout {
                timeout_ms: self.config.start_timeout_ms,
            };
            self.abort_active(reason, now, &mut step)?;
        }
        Ok(step)
    }

    /// Broadcast `stop` to every connected participant.
    pub fn stop(&mut self, now: i64) -> std::result::Result<Step, SessionError> {
        let session = self.active.as_mut().ok_or(SessionError::NoActiveSession)?;
        if session.state != SessionState::Recording {
            return Err(SessionError::NotAllowed {
                op: "stop",
                state: session.state,
            });
        }

        let mut step = Step::default();
        session.transition(SessionState::Stopping, now, &mut step)?;
        session.stopped_at = Some(now);

        let id = allocate(&mut self.next_command_id);
        session.stop = Some(Issued { id, at: now });
        for device in session.connected_ids() {
            let command =
                CommandPayload::new(id, Phase::Stop.command_name()).with_session(session.id.as_str());
            if let Some(p) = session.participants.get_mut(&device) {
                p.outstanding = Some(command.clone());
            }
            step.commands.push((device, command));
        }
        info!(session_id = %session.id, command_id = id, "stop broadcast to {} device(s)", step.commands.len());

        self.check_stopped(now, &mut step)?;
        Ok(step)
    }

    /// The stop wait ran out. Finalizes with whatever acks arrived.
    pub fn stop_deadline_elapsed(
        &mut self,
        session_id: &SessionId,
        now: i64,
    ) -> std::result::Result<Step, SessionError> {
        let mut step = Step::default();
        let stopping = self
            .active
            .as_ref()
            .is_some_and(|s| &s.id == session_id && s.state == SessionState::Stopping);
        if stopping {
            self.finalize(now, &mut step)?;
        }
        Ok(step)
    }

    /// Operator abort from any non-idle state.
    pub fn abort(&mut self, reason: impl Into<String>, now: i64) -> std::result::Result<Step, SessionError> {
        if self.active.is_none() {
            return Err(SessionError::NoActiveSession);
        }
        let mut step = Step::default();
        self.abort_active(
            AbortReason::Operator {
                reason: reason.into(),
            },
            now,
            &mut step,
        )?;
        Ok(step)
    }

    /// Move a required participant to optional while configuring or starting.
    pub fn demote(&mut self, device: &DeviceId, now: i64) -> std::result::Result<Step, SessionError> {
        let session = self.active.as_mut().ok_or(SessionError::NoActiveSession)?;
        if !matches!(
            session.state,
            SessionState::Configuring | SessionState::Starting
        ) {
            return Err(SessionError::NotAllowed {
                op: "demote",
                state: session.state,
            });
        }
        let required = session.required_count();
        let participant = session
            .participants
            .get_mut(device)
            .ok_or_else(|| SessionError::NotParticipant(device.clone()))?;

        let mut step = Step::default();
        if !participant.is_required() {
            return Ok(step);
        }
        if required == 1 {
            return Err(SessionError::LastRequired(device.clone()));
        }
        participant.role = Role::Optional;
        participant.demoted = true;
        info!(session_id = %session.id, device_id = %device, "demoted to optional");

        self.check_started(now, &mut step)?;
        Ok(step)
    }

    /// Send the outstanding start or stop again to every connected
    /// participant that has not acked it. Ids are unchanged, so a device
    /// that did get the first copy answers from its ledger.
    pub fn resend_unacked(&mut self) -> Step {
        let mut step = Step::default();
        let Some(session) = self.active.as_mut() else {
            return step;
        };
        let state = session.state;
        for (device, p) in session.participants.iter_mut() {
            let Some(command) = p.awaiting(state).cloned() else {
                continue;
            };
            p.resends += 1;
            debug!(
                session_id = %session.id,
                device_id = %device,
                command_id = command.command_id,
                "re-sending {} (#{})",
                command.command_name,
                p.resends
            );
            step.commands.push((device.clone(), command));
        }
        step
    }

    /// Re-sends are exhausted: flag every participant still owing an ack.
    /// The start/stop deadline decides what that means for the session.
    pub fn mark_unresponsive(&mut self) -> Vec<DeviceId> {
        let Some(session) = self.active.as_mut() else {
            return Vec::new();
        };
        let state = session.state;
        let mut flagged = Vec::new();
        for (device, p) in session.participants.iter_mut() {
            if p.awaiting(state).is_some() {
                p.unresponsive = true;
                warn!(
                    session_id = %session.id,
                    device_id = %device,
                    resends = p.resends,
                    "device unresponsive"
                );
                flagged.push(device.clone());
            }
        }
        flagged
    }

    pub fn device_connected(&mut self, device: &DeviceId) {
        if let Some(p) = self
            .active
            .as_mut()
            .and_then(|s| s.participants.get_mut(device))
        {
            p.connected = true;
        }
    }

    /// A participant's connection is gone.
    ///
    /// Optional devices are only noted. A required device follows the loss
    /// policy: abort the session, or demote the device and continue partial.
    pub fn device_disconnected(
        &mut self,
        device: &DeviceId,
        now: i64,
    ) -> std::result::Result<Step, SessionError> {
        let mut step = Step::default();
        let Some(session) = self.active.as_mut() else {
            return Ok(step);
        };
        let state = session.state;
        let session_id = session.id.clone();
        let Some(participant) = session.participants.get_mut(device) else {
            return Ok(step);
        };
        participant.connected = false;
        participant.disconnected_at = Some(now);
        let required = participant.is_required();

        if state == SessionState::Stopping {
            session.partial = true;
            self.check_stopped(now, &mut step)?;
            return Ok(step);
        }
        if !required {
            info!(session_id = %session_id, device_id = %device, "optional device disconnected");
            return Ok(step);
        }

        match self.config.required_loss_policy {
            LossPolicy::Abort => {
                let reason = AbortReason::RequiredDisconnected {
                    device: device.clone(),
                };
                self.abort_active(reason, now, &mut step)?;
            }
            LossPolicy::Demote => {
                participant.role = Role::Optional;
                participant.demoted = true;
                session.partial = true;
                warn!(session_id = %session_id, device_id = %device, "required device lost, demoted");
                if session.required_count() == 0 && state != SessionState::Recording {
                    let reason = AbortReason::RequiredDisconnected {
                        device: device.clone(),
                    };
                    self.abort_active(reason, now, &mut step)?;
                } else {
                    self.check_started(now, &mut step)?;
                }
            }
        }
        Ok(step)
    }

    /// Latest clock mapping for a participant. Downgrades while the session
    /// runs stick to the device's timing confidence.
    pub fn record_sync(&mut self, device: &DeviceId, snapshot: &SyncSnapshot) {
        let Some(p) = self
            .active
            .as_mut()
            .and_then(|s| s.participants.get_mut(device))
        else {
            return;
        };
        let worse = match (snapshot.status, p.flagged) {
            (SyncStatus::Unsynchronized, _) => true,
            (SyncStatus::Degraded, None) => true,
            _ => false,
        };
        if worse {
            p.flagged = Some(snapshot.status);
        }
        p.sync = Some(snapshot.clone());
    }

    /// Commands dropped on reconnect because they outlived the TTL.
    pub fn record_discarded(&mut self, device: &DeviceId, commands: &[CommandId]) {
        if let Some(p) = self
            .active
            .as_mut()
            .and_then(|s| s.participants.get_mut(device))
        {
            p.discarded.extend_from_slice(commands);
        }
    }

    fn abort_active(
        &mut self,
        reason: AbortReason,
        now: i64,
        step: &mut Step,
    ) -> std::result::Result<(), SessionError> {
        let Some(mut session) = self.active.take() else {
            return Err(SessionError::NoActiveSession);
        };
        let state_at_abort = session.state;
        if let Err(e) = session.transition(SessionState::Aborted, now, step) {
            self.active = Some(session);
            return Err(e);
        }
        warn!(session_id = %session.id, "session aborted in {}: {}", state_at_abort, reason);

        let recipients: Vec<DeviceId> = session
            .participants
            .iter()
            .filter(|(_, p)| p.connected && p.started_ok())
            .map(|(id, _)| id.clone())
            .collect();
        if !recipients.is_empty() {
            let id = allocate(&mut self.next_command_id);
            session.abort = Some(Issued { id, at: now });
            for device in recipients {
                let command = CommandPayload::new(id, Phase::Abort.command_name())
                    .with_session(session.id.as_str())
                    .with_param("reason", Value::String(reason.to_string()));
                step.commands.push((device, command));
            }
        }

        let summary = session.abort_summary(reason, state_at_abort);
        let report = session.report(Outcome::Aborted, Some(summary), Vec::new(), now);

        self.last_aborted = Some(RetryTemplate {
            session_id: session.id.clone(),
            request: session.request.clone(),
            roles: session
                .participants
                .iter()
                .map(|(id, p)| (id.clone(), p.role, p.demoted))
                .collect(),
        });
        self.archive(report.clone());
        step.finished = Some(report);
        Ok(())
    }

    fn finalize(&mut self, now: i64, step: &mut Step) -> std::result::Result<(), SessionError> {
        let Some(mut session) = self.active.take() else {
            return Err(SessionError::NoActiveSession);
        };
        if let Err(e) = session.transition(SessionState::Finalizing, now, step) {
            self.active = Some(session);
            return Err(e);
        }

        let non_responding: Vec<DeviceId> = session
            .participants
            .iter()
            .filter(|(_, p)| p.stop.is_none())
            .map(|(id, _)| id.clone())
            .collect();
        let failed = session
            .participants
            .values()
            .any(|p| p.stop.as_ref().is_some_and(|a| !a.success));
        if !non_responding.is_empty() {
            warn!(
                session_id = %session.id,
                "no stop ack from {:?}, session is partial",
                non_responding
            );
        }
        let partial = session.partial || failed || !non_responding.is_empty();
        session.transition(SessionState::Idle, now, step)?;

        let outcome = if partial {
            Outcome::Partial
        } else {
            Outcome::Completed
        };
        info!(session_id = %session.id, "session finished {:?}", outcome);
        let report = session.report(outcome, None, non_responding, now);
        self.archive(report.clone());
        step.finished = Some(report);
        Ok(())
    }

    fn archive(&mut self, report: SessionReport) {
        self.history.push_back(report);
        while self.history.len() > self.config.history_limit.max(1) {
            self.history.pop_front();
        }
    }
}
