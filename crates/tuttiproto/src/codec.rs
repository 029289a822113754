//! Length-prefixed framing.
//!
//! A frame is a 4-byte big-endian length followed by that many bytes of
//! UTF-8 JSON. The declared length is checked against the configured maximum
//! as soon as the header is readable, so an oversized frame is rejected
//! before any of its body is buffered.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::message::{Message, WireEnvelope};
use crate::ProtocolError;

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Default upper bound on a frame body (1 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Result of attempting to decode one frame from a byte buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A complete frame; `consumed` bytes (header included) can be discarded.
    Frame { message: Message, consumed: usize },
    /// Not enough bytes yet. `needed` is the total buffer length required.
    NeedMoreBytes { needed: usize },
}

/// Serialize a message into a complete frame (header + body).
pub fn encode(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let body = encode_body(message)?;
    let len = header_for(body.len(), u32::MAX as usize)?;
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Length prefix for a body of `len` bytes, refused past `max` or past
/// what the 4-byte header can express.
fn header_for(len: usize, max: usize) -> Result<u32, ProtocolError> {
    match u32::try_from(len) {
        Ok(header) if len <= max => Ok(header),
        _ => Err(ProtocolError::FrameTooLarge {
            declared: len,
            max: max.min(u32::MAX as usize),
        }),
    }
}

fn encode_body(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let envelope = message.to_envelope().map_err(ProtocolError::Malformed)?;
    serde_json::to_vec(&envelope).map_err(ProtocolError::Malformed)
}

/// Read the declared body length from a buffer holding at least a header.
fn declared_len(bytes: &[u8]) -> usize {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
}

/// Try to decode the first frame in `bytes`.
pub fn decode_frame(bytes: &[u8], max_frame_bytes: usize) -> Result<Decoded, ProtocolError> {
    if bytes.len() < HEADER_LEN {
        return Ok(Decoded::NeedMoreBytes { needed: HEADER_LEN });
    }

    let len = declared_len(bytes);
    if len > max_frame_bytes {
        return Err(ProtocolError::FrameTooLarge {
            declared: len,
            max: max_frame_bytes,
        });
    }

    let total = HEADER_LEN + len;
    if bytes.len() < total {
        return Ok(Decoded::NeedMoreBytes { needed: total });
    }

    let message = decode_body(&bytes[HEADER_LEN..total])?;
    Ok(Decoded::Frame {
        message,
        consumed: total,
    })
}

fn decode_body(body: &[u8]) -> Result<Message, ProtocolError> {
    let text = std::str::from_utf8(body).map_err(|_| ProtocolError::InvalidUtf8)?;
    let envelope: WireEnvelope = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;
    Message::from_envelope(envelope)
}

/// `tokio_util` codec over [`decode_frame`] / [`encode`].
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl FrameCodec {
    #[must_use]
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = declared_len(src);
        if len > self.max_frame_bytes {
            return Err(ProtocolError::FrameTooLarge {
                declared: len,
                max: self.max_frame_bytes,
            });
        }

        let total = HEADER_LEN + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let body = src.split_to(len);
        decode_body(&body).map(Some)
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = encode_body(&item)?;
        let len = header_for(body.len(), self.max_frame_bytes)?;
        dst.reserve(HEADER_LEN + body.len());
        dst.put_u32(len);
        dst.extend_from_slice(&body);
        Ok(())
    }
}
