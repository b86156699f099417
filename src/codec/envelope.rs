//! JSON control envelope `{"type": ..., "payload": ...}`.
//!
//! # Example
//!
//! ```
//! use imgwire::codec::{tags, Envelope, JsonCodec};
//! use serde_json::json;
//!
//! let bytes = JsonCodec::encode(tags::RESPONSE, &json!({"id": 2, "result": 7})).unwrap();
//! let envelope: Envelope = JsonCodec::decode(&bytes).unwrap();
//! assert_eq!(envelope.kind, "response");
//! assert_eq!(envelope.payload["result"], 7);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Well-known envelope tags.
pub mod tags {
    /// Kind that selects a binary frame instead of a JSON envelope.
    pub const BINARY: &str = "binary";
    /// Remote side accepted our credentials.
    pub const AUTHENTICATED: &str = "authenticated";
    /// Successful reply: `{"id", "result"}`.
    pub const RESPONSE: &str = "response";
    /// Failed reply: `{"id", "error"}`.
    pub const ERROR: &str = "error";
    /// Reply whose data follows as a binary frame: `{"id", "checksum"}`.
    pub const CHECKSUM_PROMISE: &str = "checksumPromise";
}

/// Decoded control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message tag (`type` on the wire).
    #[serde(rename = "type")]
    pub kind: String,
    /// Arbitrary JSON payload; `null` when absent.
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Create an envelope.
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: &'a str,
    payload: &'a T,
}

/// JSON codec for control envelopes.
pub struct JsonCodec;

impl JsonCodec {
    /// Serialize `{type: kind, payload: data}` to UTF-8 bytes.
    #[inline]
    pub fn encode<T: Serialize>(kind: &str, data: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&EnvelopeRef {
            kind,
            payload: data,
        })?)
    }

    /// Parse an envelope from UTF-8 JSON bytes.
    #[inline]
    pub fn decode(bytes: &[u8]) -> Result<Envelope> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
