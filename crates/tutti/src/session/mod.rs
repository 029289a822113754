//! Recording sessions: lifecycle types, the orchestrator state machine, and
//! the structured report handed to operators.
//!
//! ```text
//! Idle -> Configuring -> Starting -> Recording -> Stopping -> Finalizing -> Idle
//!            \______________\____________\____________\________-> Aborted
//! ```
//!
//! At most one session is active at a time. A session reaches Recording only
//! once every required device has acknowledged the same start command.

pub mod orchestrator;
pub mod report;

pub use orchestrator::{DeadlineKind, DeviceView, Orchestrator, ParticipantView, SessionView, Step};
pub use report::{
    AbortReason, AbortSummary, AckSummary, DeviceReport, Exclusion, ExclusionReason, Outcome,
    SessionReport, StateChange, TimingConfidence,
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;
use tuttiproto::{Capability, DeviceId};

/// Unique identifier for a recording session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Generate a new unique session ID
    pub fn generate() -> Self {
        let timestamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
        let random = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("session-{}-{}", timestamp, &random[..8]))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Configuring,
    Starting,
    Recording,
    Stopping,
    Finalizing,
    Aborted,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Configuring => "configuring",
            SessionState::Starting => "starting",
            SessionState::Recording => "recording",
            SessionState::Stopping => "stopping",
            SessionState::Finalizing => "finalizing",
            SessionState::Aborted => "aborted",
        }
    }

    /// Edges of the lifecycle graph. Aborted is reachable from any state
    /// that has left Idle and isn't already terminal.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Idle, Configuring)
            | (Configuring, Starting)
            | (Starting, Recording)
            | (Recording, Stopping)
            | (Stopping, Finalizing)
            | (Finalizing, Idle) => true,
            (Configuring | Starting | Recording | Stopping | Finalizing, Aborted) => true,
            _ => false,
        }
    }

    /// States in which a session occupies the single active slot.
    pub fn is_active(&self) -> bool {
        !matches!(self, SessionState::Idle | SessionState::Aborted)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a participant's acknowledgement gates the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Required,
    Optional,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Required => "required",
            Role::Optional => "optional",
        }
    }
}

/// Operator request to create a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionRequest {
    /// Capabilities a device must provide in full to be required
    pub capabilities: Vec<Capability>,
    /// Opaque parameters forwarded to every participant in `configure`
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl SessionRequest {
    pub fn for_capabilities(capabilities: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            capabilities: capabilities.into_iter().collect(),
            ..Default::default()
        }
    }
}

/// Rejected session operations. Never coerced into a valid state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session {0} is already active")]
    AlreadyActive(SessionId),

    #[error("no active session")]
    NoActiveSession,

    #[error("cannot {op} while session is {state}")]
    NotAllowed {
        op: &'static str,
        state: SessionState,
    },

    #[error("invalid transition {from} -> {to}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },

    #[error("device {0} is not a participant in the active session")]
    NotParticipant(DeviceId),

    #[error("cannot demote {0}: it is the last required device")]
    LastRequired(DeviceId),

    #[error("no aborted session to retry")]
    NothingToRetry,

    #[error("session request names no capabilities")]
    EmptyRequest,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_edges() {
        use SessionState::*;
        let happy = [Idle, Configuring, Starting, Recording, Stopping, Finalizing, Idle];
        for pair in happy.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }

        assert!(!Idle.can_transition_to(Starting));
        assert!(!Recording.can_transition_to(Starting));
        assert!(!Configuring.can_transition_to(Recording));
        assert!(!Idle.can_transition_to(Aborted));
        assert!(!Aborted.can_transition_to(Idle));
        assert!(!Aborted.can_transition_to(Aborted));
        for from in [Configuring, Starting, Recording, Stopping, Finalizing] {
            assert!(from.can_transition_to(Aborted));
        }
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("session-"));
    }
}
