//! Structured session reports.
//!
//! A report is produced for every session that leaves the active slot,
//! whether it completed, finished partially, or aborted. Rendering is left
//! to whoever consumes the JSON.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tuttiproto::{Capability, CommandId, DeviceId};

use super::{Role, SessionId, SessionState};
use crate::clock::{SyncSnapshot, SyncStatus};

/// Convert a reference-clock timestamp to UTC.
pub fn utc(nanos: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(nanos)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    /// Recorded, but some device stopped acknowledging or was lost
    Partial,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    /// Required devices didn't ack start in time
    StartTimeout { timeout_ms: u64 },
    /// A required device answered a command with `success: false`
    RequiredRejected {
        device: DeviceId,
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    RequiredDisconnected { device: DeviceId },
    Operator { reason: String },
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::StartTimeout { timeout_ms } => {
                write!(f, "required devices did not ack start within {}ms", timeout_ms)
            }
            AbortReason::RequiredRejected {
                device,
                command,
                detail,
            } => {
                write!(f, "required device {} rejected {}", device, command)?;
                if let Some(detail) = detail {
                    write!(f, ": {}", detail)?;
                }
                Ok(())
            }
            AbortReason::RequiredDisconnected { device } => {
                write!(f, "required device {} disconnected", device)
            }
            AbortReason::Operator { reason } => write!(f, "operator abort: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbortSummary {
    pub reason: AbortReason,
    pub state_at_abort: SessionState,
    /// Participants that answered the start command (either way)
    pub responding: Vec<DeviceId>,
    /// Participants that never answered the start command
    pub non_responding: Vec<DeviceId>,
    /// Required participants among the non-responders
    pub missing_required: Vec<DeviceId>,
    /// Participants that answered start with a failure
    pub failed: Vec<DeviceId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckSummary {
    pub command_id: CommandId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    /// Time from broadcast to ack, on the controller clock
    pub latency_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingConfidence {
    High,
    /// Too few sync samples to judge
    Low,
    Degraded,
    Unsynchronized,
    Unknown,
}

impl From<Option<SyncStatus>> for TimingConfidence {
    fn from(status: Option<SyncStatus>) -> Self {
        match status {
            Some(SyncStatus::Synchronized) => TimingConfidence::High,
            Some(SyncStatus::Pending) => TimingConfidence::Low,
            Some(SyncStatus::Degraded) => TimingConfidence::Degraded,
            Some(SyncStatus::Unsynchronized) => TimingConfidence::Unsynchronized,
            None => TimingConfidence::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceReport {
    pub device_id: DeviceId,
    pub role: Role,
    /// Was required, demoted by an operator or the loss policy
    pub demoted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configure: Option<AckSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<AckSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<AckSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncSnapshot>,
    pub timing_confidence: TimingConfidence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disconnected_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub discarded_commands: Vec<CommandId>,
    /// Times an unacknowledged start or stop was sent again
    #[serde(default, skip_serializing_if = "is_zero")]
    pub resends: u32,
    /// Re-sends ran out without an ack
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unresponsive: bool,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    /// Shares no capability with the request
    NoMatchingCapability,
    Unsynchronized,
    /// Was a participant of the retried session but is no longer connected
    NotConnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusion {
    pub device_id: DeviceId,
    pub reason: ExclusionReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub state: SessionState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<SessionId>,
    pub outcome: Outcome,
    pub requested_capabilities: Vec<Capability>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_command_id: Option<CommandId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_at_reference_ns: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_command_id: Option<CommandId>,
    pub devices: Vec<DeviceReport>,
    pub excluded: Vec<Exclusion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort: Option<AbortSummary>,
    /// Participants that never acked stop
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_non_responding: Vec<DeviceId>,
    pub history: Vec<StateChange>,
}

impl SessionReport {
    pub fn device(&self, id: &DeviceId) -> Option<&DeviceReport> {
        self.devices.iter().find(|d| &d.device_id == id)
    }

    /// Write the report as pretty JSON into `dir`, named after the session.
    pub async fn persist(&self, dir: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create report dir {}", dir.display()))?;

        let path = dir.join(format!("{}.json", self.session_id));
        let json = serde_json::to_vec_pretty(self).context("Failed to serialize session report")?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        Ok(path)
    }
}
