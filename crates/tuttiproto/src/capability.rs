//! Capability tags advertised by devices in their hello.
//!
//! Tags are opaque to the coordination core: the orchestrator only matches
//! them against a session request. The known set is closed, and anything else
//! round-trips through [`Capability::Unknown`] unchanged.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Capability {
    /// RGB video capture
    Camera,
    /// Thermal imaging
    Thermal,
    /// Galvanic skin response sensor
    Gsr,
    /// Microphone capture
    Audio,
    /// Inertial measurement unit
    Imu,
    /// Tag from a newer device that this build doesn't know about
    Unknown(String),
}

impl Capability {
    pub fn as_str(&self) -> &str {
        match self {
            Capability::Camera => "camera",
            Capability::Thermal => "thermal",
            Capability::Gsr => "gsr",
            Capability::Audio => "audio",
            Capability::Imu => "imu",
            Capability::Unknown(tag) => tag,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Capability::Unknown(_))
    }
}

impl From<&str> for Capability {
    fn from(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "camera" => Capability::Camera,
            "thermal" => Capability::Thermal,
            "gsr" => Capability::Gsr,
            "audio" => Capability::Audio,
            "imu" => Capability::Imu,
            _ => Capability::Unknown(tag.to_string()),
        }
    }
}

impl From<String> for Capability {
    fn from(tag: String) -> Self {
        Capability::from(tag.as_str())
    }
}

impl From<Capability> for String {
    fn from(cap: Capability) -> Self {
        match cap {
            Capability::Unknown(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
