//! Message types and the JSON envelope they travel in.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::capability::Capability;
use crate::timing::unix_nanos;
use crate::ProtocolError;

/// Per-session command identifier. Strictly increasing within one session.
pub type CommandId = u64;

/// Unique device identifier, chosen by the device and announced in its hello.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Outbound scheduling class. Under queue pressure `Bulk` is shed first;
/// `Critical` messages are never shed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Bulk,
    Normal,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    pub device_id: DeviceId,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    pub protocol_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloAckPayload {
    pub accepted: bool,
    pub protocol_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandPayload {
    pub command_id: CommandId,
    pub command_name: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl CommandPayload {
    pub fn new(command_id: CommandId, command_name: impl Into<String>) -> Self {
        Self {
            command_id,
            command_name: command_name.into(),
            parameters: Map::new(),
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    pub command_id: CommandId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl AckPayload {
    pub fn ok(command_id: CommandId) -> Self {
        Self {
            command_id,
            success: true,
            error_detail: None,
            session_id: None,
        }
    }

    pub fn failed(command_id: CommandId, detail: impl Into<String>) -> Self {
        Self {
            command_id,
            success: false,
            error_detail: Some(detail.into()),
            session_id: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    /// Battery charge in percent (0-100)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<f32>,
    /// Free storage in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_free: Option<u64>,
    /// Device temperature in degrees Celsius
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_temp: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequestPayload {
    pub exchange_id: u64,
    /// Requester clock at send, ns since Unix epoch
    pub t0: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReplyPayload {
    pub exchange_id: u64,
    /// Echo of the request's t0
    pub t0: i64,
    /// Responder clock at receipt of the request
    pub t1: i64,
    /// Responder clock at send of this reply
    pub t2: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataNotifyPayload {
    pub stream_id: String,
    pub sequence_number: u64,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Type-specific part of a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Hello(HelloPayload),
    HelloAck(HelloAckPayload),
    Command(CommandPayload),
    Ack(AckPayload),
    Status(StatusPayload),
    SyncRequest(SyncRequestPayload),
    SyncReply(SyncReplyPayload),
    DataNotify(DataNotifyPayload),
    Heartbeat,
    Disconnect(DisconnectPayload),
    /// A `type` this build doesn't recognize, kept verbatim
    Unknown { kind: String, payload: Value },
}

impl Body {
    /// Wire name used in the envelope's `type` field.
    pub fn kind(&self) -> &str {
        match self {
            Body::Hello(_) => "hello",
            Body::HelloAck(_) => "helloAck",
            Body::Command(_) => "command",
            Body::Ack(_) => "ack",
            Body::Status(_) => "status",
            Body::SyncRequest(_) => "syncRequest",
            Body::SyncReply(_) => "syncReply",
            Body::DataNotify(_) => "dataNotify",
            Body::Heartbeat => "heartbeat",
            Body::Disconnect(_) => "disconnect",
            Body::Unknown { kind, .. } => kind,
        }
    }

    pub fn priority(&self) -> Priority {
        match self {
            Body::Hello(_)
            | Body::HelloAck(_)
            | Body::Command(_)
            | Body::Ack(_)
            | Body::Disconnect(_) => Priority::Critical,
            Body::Heartbeat | Body::SyncRequest(_) | Body::SyncReply(_) => Priority::Normal,
            Body::Status(_) | Body::DataNotify(_) | Body::Unknown { .. } => Priority::Bulk,
        }
    }

    fn payload_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            Body::Hello(p) => serde_json::to_value(p),
            Body::HelloAck(p) => serde_json::to_value(p),
            Body::Command(p) => serde_json::to_value(p),
            Body::Ack(p) => serde_json::to_value(p),
            Body::Status(p) => serde_json::to_value(p),
            Body::SyncRequest(p) => serde_json::to_value(p),
            Body::SyncReply(p) => serde_json::to_value(p),
            Body::DataNotify(p) => serde_json::to_value(p),
            Body::Heartbeat => Ok(Value::Object(Map::new())),
            Body::Disconnect(p) => serde_json::to_value(p),
            Body::Unknown { payload, .. } => Ok(payload.clone()),
        }
    }
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Sender's clock when the message was built, ns since Unix epoch
    pub timestamp: i64,
    /// Device the message is from (device→controller) or for (controller→device).
    /// `None` only on hello.
    pub device_id: Option<DeviceId>,
    /// Per-sender sequence number
    pub seq: u64,
    pub body: Body,
}

impl Message {
    /// Build a message stamped with the current wall clock.
    pub fn new(device_id: Option<DeviceId>, seq: u64, body: Body) -> Self {
        Self {
            timestamp: unix_nanos(),
            device_id,
            seq,
            body,
        }
    }

    /// The initial hello; carries no envelope device id.
    pub fn hello(payload: HelloPayload) -> Self {
        Self::new(None, 0, Body::Hello(payload))
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn kind(&self) -> &str {
        self.body.kind()
    }

    pub fn priority(&self) -> Priority {
        self.body.priority()
    }

    /// Any message except disconnect counts as proof of life.
    pub fn indicates_liveness(&self) -> bool {
        !matches!(self.body, Body::Disconnect(_))
    }

    pub(crate) fn to_envelope(&self) -> Result<WireEnvelope, serde_json::Error> {
        Ok(WireEnvelope {
            kind: Some(self.body.kind().to_string()),
            timestamp: Some(self.timestamp),
            device_id: self.device_id.clone(),
            seq: self.seq,
            payload: self.body.payload_value()?,
        })
    }

    pub(crate) fn from_envelope(envelope: WireEnvelope) -> Result<Self, ProtocolError> {
        let kind = envelope.kind.ok_or(ProtocolError::MissingField("type"))?;
        let timestamp = envelope
            .timestamp
            .ok_or(ProtocolError::MissingField("timestamp"))?;

        if kind != "hello" && envelope.device_id.is_none() {
            return Err(ProtocolError::MissingField("deviceId"));
        }

        let payload = match envelope.payload {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };

        let body = match kind.as_str() {
            "hello" => Body::Hello(parse_payload("hello", payload)?),
            "helloAck" => Body::HelloAck(parse_payload("helloAck", payload)?),
            "command" => Body::Command(parse_payload("command", payload)?),
            "ack" => Body::Ack(parse_payload("ack", payload)?),
            "status" => Body::Status(parse_payload("status", payload)?),
            "syncRequest" => Body::SyncRequest(parse_payload("syncRequest", payload)?),
            "syncReply" => Body::SyncReply(parse_payload("syncReply", payload)?),
            "dataNotify" => Body::DataNotify(parse_payload("dataNotify", payload)?),
            "heartbeat" => Body::Heartbeat,
            "disconnect" => Body::Disconnect(parse_payload("disconnect", payload)?),
            _ => Body::Unknown { kind, payload },
        };

        Ok(Message {
            timestamp,
            device_id: envelope.device_id,
            seq: envelope.seq,
            body,
        })
    }
}

fn parse_payload<T: DeserializeOwned>(kind: &'static str, payload: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(payload).map_err(|source| ProtocolError::InvalidPayload { kind, source })
}

/// JSON shape of a frame body. Required fields are optional here so that
/// their absence surfaces as [`ProtocolError::MissingField`] instead of a
/// generic parse error.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireEnvelope {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub payload: Value,
}
