//! Error taxonomy for the coordination core.
//!
//! Transport faults are recovered locally (reconnect, resync). Anything that
//! reaches an operator is one of these variants.

use thiserror::Error;
use tuttiproto::{Capability, DeviceId, ProtocolError};

use crate::session::SessionError;

#[derive(Debug, Error)]
pub enum TuttiError {
    /// Malformed frame or missing field. The connection is torn down and the
    /// device must reconnect with a fresh hello.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// An ack or sync reply didn't arrive in time.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// An invalid session-state transition was attempted.
    #[error(transparent)]
    Consistency(#[from] SessionError),

    /// Sync quality dropped below threshold. Non-fatal; lowers the device's
    /// timing confidence.
    #[error("clock quality for {device} is {status}: rms {rms_us:.0}us (threshold {threshold_us}us)")]
    ClockQuality {
        device: DeviceId,
        status: &'static str,
        rms_us: f64,
        threshold_us: u64,
    },

    #[error("unknown device: {0}")]
    UnknownDevice(DeviceId),

    #[error("no device provides all of {requested:?}")]
    NoEligibleDevices {
        requested: Vec<Capability>,
        unsynchronized: Vec<DeviceId>,
    },

    #[error("controller is not running")]
    ControllerUnavailable,
}

impl TuttiError {
    /// Stable machine-readable tag for API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            TuttiError::Protocol(_) => "protocol",
            TuttiError::Timeout(_) => "timeout",
            TuttiError::Consistency(_) => "consistency",
            TuttiError::ClockQuality { .. } => "clock_quality",
            TuttiError::UnknownDevice(_) => "unknown_device",
            TuttiError::NoEligibleDevices { .. } => "no_eligible_devices",
            TuttiError::ControllerUnavailable => "controller_unavailable",
        }
    }
}

pub type Result<T> = std::result::Result<T, TuttiError>;
