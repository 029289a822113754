//! tuttiproto - Wire protocol for the Tutti recording coordinator
//!
//! This crate defines the messages exchanged between the Tutti controller and
//! the recording devices (phones, thermal cameras, physiological sensors) that
//! dial into it, plus the framing used to carry them over one reliable ordered
//! byte stream per device.
//!
//! ## Wire Format
//!
//! Every message is a length-prefixed frame:
//!
//! ```text
//! +----------------------------+---------------------------+
//! | Length (4 bytes, BE u32)   | UTF-8 JSON body           |
//! +----------------------------+---------------------------+
//! ```
//!
//! The JSON body is an envelope:
//!
//! ```json
//! {"type":"ack","timestamp":1717000000000000000,"deviceId":"cam-1","seq":7,
//!  "payload":{"commandId":3,"success":true}}
//! ```
//!
//! `deviceId` is omitted only on `hello` (the device names itself inside the
//! hello payload). Unrecognized `type` values decode to [`Body::Unknown`]
//! so that newer devices can talk to older controllers.
//!
//! ## Message Types
//!
//! | Type | Direction | Payload |
//! |------|-----------|---------|
//! | `hello` | device→controller | deviceId, capabilities, protocolVersion |
//! | `helloAck` | controller→device | accepted, protocolVersion, reason |
//! | `command` | controller→device | commandId, commandName, parameters |
//! | `ack` | device→controller | commandId, success, errorDetail |
//! | `status` | device→controller | batteryLevel, storageFree, deviceTemp |
//! | `syncRequest` | either | exchangeId, t0 |
//! | `syncReply` | either | exchangeId, t0, t1, t2 |
//! | `dataNotify` | device→controller | streamId, sequenceNumber, metadata |
//! | `heartbeat` | either | empty |
//! | `disconnect` | either | reason |
//!
//! ## Codec
//!
//! [`codec::encode`] and [`codec::decode_frame`] are pure functions.
//! [`FrameCodec`] wraps them for `tokio_util::codec::Framed`.

pub mod capability;
pub mod codec;
pub mod message;
pub mod retry;
pub mod timing;

pub use capability::Capability;
pub use codec::{decode_frame, encode, Decoded, FrameCodec, DEFAULT_MAX_FRAME_BYTES, HEADER_LEN};
pub use message::{
    AckPayload, Body, CommandId, CommandPayload, DataNotifyPayload, DeviceId, DisconnectPayload,
    HelloAckPayload, HelloPayload, Message, Priority, StatusPayload, SyncReplyPayload,
    SyncRequestPayload,
};
pub use retry::RetryPolicy;

/// Protocol version spoken by this crate. Bump on breaking envelope changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Errors produced while framing or parsing messages.
///
/// Any of these on a live connection means the stream can no longer be
/// trusted: the connection is torn down and the device must reconnect and
/// send a fresh hello.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame of {declared} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { declared: usize, max: usize },

    #[error("frame body is not valid UTF-8")]
    InvalidUtf8,

    #[error("malformed frame body: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid payload for {kind}: {source}")]
    InvalidPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("expected {expected}, got {got}")]
    UnexpectedMessage { expected: &'static str, got: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
