//! Codec module - whole-message encoding and decoding.
//!
//! - [`FrameCodec`] turns a logical message into a framed byte vector and back
//! - [`JsonCodec`] / [`Envelope`] handle the `{type, payload}` control format
//!
//! # Design
//!
//! Decoding returns `Option`: a frame that is malformed, oversized or missing
//! a required mask is dropped (logged at `debug`) and yields `None`. A
//! long-lived channel survives a single bad frame this way.
//!
//! # Example
//!
//! ```
//! use imgwire::codec::{FrameCodec, Message, Role};
//! use serde_json::json;
//!
//! let client = FrameCodec::new(Role::Client);
//! let server = FrameCodec::new(Role::Server);
//!
//! let bytes = client.encode_json("loadImage", &json!({"id": 2})).unwrap();
//! match server.decode(&bytes) {
//!     Some(Message::Control(envelope)) => assert_eq!(envelope.kind, "loadImage"),
//!     other => panic!("unexpected {:?}", other),
//! }
//! ```

mod envelope;

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use serde_json::{json, Value};

use crate::correlation::Checksum;
use crate::error::{LinkError, Result};
use crate::protocol::{
    build_frame, finish_frame, Frame, FrameBuffer, Header, Opcode, MAX_PAYLOAD_SIZE,
};

pub use envelope::{tags, Envelope, JsonCodec};

/// Which side of the channel a codec serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// Masks outbound frames; accepts masked or unmasked inbound.
    #[default]
    Client,
    /// Sends unmasked; drops inbound frames that carry no mask.
    Server,
    /// Worker message channel: never masks, accepts either.
    Peer,
}

impl Role {
    /// Whether frames sent by this role are masked.
    #[inline]
    pub fn masks_outbound(self) -> bool {
        self == Role::Client
    }

    /// Whether frames received by this role must be masked.
    #[inline]
    pub fn requires_inbound_mask(self) -> bool {
        self == Role::Server
    }
}

/// Data handed to [`FrameCodec::encode`].
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Json(Value),
    Binary(Bytes),
}

impl From<Value> for Outgoing {
    fn from(value: Value) -> Self {
        Outgoing::Json(value)
    }
}

impl From<Bytes> for Outgoing {
    fn from(bytes: Bytes) -> Self {
        Outgoing::Binary(bytes)
    }
}

impl From<Vec<u8>> for Outgoing {
    fn from(bytes: Vec<u8>) -> Self {
        Outgoing::Binary(Bytes::from(bytes))
    }
}

/// A decoded logical message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Parsed JSON control envelope.
    Control(Envelope),
    /// Raw binary payload.
    Binary(Bytes),
}

impl Message {
    /// Interpret a frame. Text frames that are not a valid envelope are
    /// dropped.
    pub fn from_frame(frame: Frame) -> Option<Self> {
        match frame.opcode {
            Opcode::Binary => Some(Message::Binary(frame.payload)),
            Opcode::Text => match JsonCodec::decode(&frame.payload) {
                Ok(envelope) => Some(Message::Control(envelope)),
                Err(e) => {
                    tracing::debug!(error = %e, "dropping text frame with invalid envelope");
                    None
                }
            },
        }
    }
}

/// Frame codec bound to a role and a payload cap.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    role: Role,
    max_payload_size: u32,
}

impl FrameCodec {
    /// Create a codec with the default 64 KiB payload cap.
    pub fn new(role: Role) -> Self {
        Self::with_max_payload(role, MAX_PAYLOAD_SIZE)
    }

    /// Create a codec with a custom payload cap (decode side only).
    pub fn with_max_payload(role: Role, max_payload_size: u32) -> Self {
        Self {
            role,
            max_payload_size,
        }
    }

    /// Get the role.
    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Get the decode-side payload cap.
    #[inline]
    pub fn max_payload_size(&self) -> u32 {
        self.max_payload_size
    }

    /// Encode a logical message.
    ///
    /// `kind == "binary"` sends `data` as a binary frame and requires
    /// [`Outgoing::Binary`]; any other kind wraps JSON `data` in an envelope
    /// and requires [`Outgoing::Json`].
    pub fn encode(&self, kind: &str, data: Outgoing) -> Result<Vec<u8>> {
        match (kind == tags::BINARY, data) {
            (true, Outgoing::Binary(bytes)) => self.encode_binary(&bytes),
            (false, Outgoing::Json(value)) => self.encode_json(kind, &value),
            (true, Outgoing::Json(_)) => Err(LinkError::Protocol(
                "binary kind requires byte data".to_string(),
            )),
            (false, Outgoing::Binary(_)) => Err(LinkError::Protocol(format!(
                "kind {:?} requires JSON data",
                kind
            ))),
        }
    }

    /// Encode `{type: kind, payload: data}` as a text frame.
    pub fn encode_json<T: Serialize>(&self, kind: &str, data: &T) -> Result<Vec<u8>> {
        let payload = JsonCodec::encode(kind, data)?;
        self.frame(Opcode::Text, &payload)
    }

    /// Encode a successful reply to request `id`.
    pub fn encode_response<T: Serialize>(&self, id: u64, result: &T) -> Result<Vec<u8>> {
        self.encode_json(tags::RESPONSE, &json!({ "id": id, "result": result }))
    }

    /// Encode a failed reply to request `id`.
    pub fn encode_error<T: Serialize>(&self, id: u64, error: &T) -> Result<Vec<u8>> {
        self.encode_json(tags::ERROR, &json!({ "id": id, "error": error }))
    }

    /// Encode a checksum promise for request `id`; the data itself goes out
    /// separately via [`encode_binary`](Self::encode_binary).
    pub fn encode_promise(&self, id: u64, checksum: &Checksum) -> Result<Vec<u8>> {
        self.encode_json(
            tags::CHECKSUM_PROMISE,
            &json!({ "id": id, "checksum": checksum.as_str() }),
        )
    }

    /// Encode raw bytes as a binary frame.
    pub fn encode_binary(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.frame(Opcode::Binary, data)
    }

    fn frame(&self, opcode: Opcode, payload: &[u8]) -> Result<Vec<u8>> {
        let length = i32::try_from(payload.len()).map_err(|_| {
            LinkError::Protocol(format!(
                "payload of {} bytes does not fit the length field",
                payload.len()
            ))
        })?;
        let header = if self.role.masks_outbound() {
            Header::masked(opcode, length, rand::random::<[u8; 4]>())
        } else {
            Header::new(opcode, length)
        };
        Ok(build_frame(&header, payload))
    }

    /// Decode one frame from the start of `buf`.
    ///
    /// Returns `None` (drop) for a truncated, malformed, oversized or
    /// improperly unmasked frame. Bytes past the frame are ignored.
    pub fn decode_frame(&self, buf: &[u8]) -> Option<Frame> {
        let header = Header::decode(buf)?;
        if let Err(fault) = header.admit(self.max_payload_size, self.role.requires_inbound_mask())
        {
            tracing::debug!(?fault, length = header.payload_length, "dropping frame");
            return None;
        }

        let start = header.data_start();
        let end = start + header.payload_length as usize;
        if buf.len() < end {
            tracing::debug!(
                declared = header.payload_length,
                available = buf.len() - start,
                "dropping truncated frame"
            );
            return None;
        }

        Some(finish_frame(&header, BytesMut::from(&buf[start..end])))
    }

    /// Decode one frame and interpret it as a [`Message`].
    pub fn decode(&self, buf: &[u8]) -> Option<Message> {
        self.decode_frame(buf).and_then(Message::from_frame)
    }

    /// Create a streaming frame buffer with this codec's policy.
    pub fn frame_buffer(&self) -> FrameBuffer {
        FrameBuffer::with_policy(self.max_payload_size, self.role.requires_inbound_mask())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(Role::default())
    }
}
