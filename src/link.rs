//! Link builder and inbound routing.
//!
//! A [`Link`] ties a [`FrameCodec`], a streaming [`FrameBuffer`] and a
//! [`CorrelationRegistry`] together. It is the surface the transport layer
//! and the rest of the application talk to:
//!
//! - transport: [`Link::send`] before writing, [`Link::on_frame`] on every
//!   inbound chunk
//! - application: [`Link::register_request`], [`Link::complete_request`],
//!   [`Link::fail_request`], [`Link::submit_binary`]
//!
//! Inbound envelopes tagged `response`, `error`, `checksumPromise` and
//! `authenticated` are consumed by the link. Anything else is handed back to
//! the caller of `on_frame`.
//!
//! # Example
//!
//! ```
//! use imgwire::codec::Role;
//! use imgwire::Link;
//! use serde_json::json;
//!
//! let mut link = Link::builder().role(Role::Peer).no_timeout().build();
//! let mut worker = Link::builder().role(Role::Peer).build();
//!
//! let (id, _reply) = link.register_request("histogram");
//! let request = link.send("histogram", json!({"id": id})).unwrap();
//!
//! let inbound = worker.on_frame(&request);
//! assert_eq!(inbound[0].kind, "histogram");
//!
//! let response = worker.respond(id, &json!([0, 4, 9])).unwrap();
//! assert!(link.on_frame(&response).is_empty());
//! assert_eq!(link.registry().pending_count(), 0);
//! ```

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::codec::{tags, Envelope, FrameCodec, Message, Outgoing, Role};
use crate::correlation::{
    BinaryDisposition, Checksum, CorrelationRegistry, PendingReply, DEFAULT_TIMEOUT,
};
use crate::error::Result;
use crate::protocol::{FrameBuffer, MAX_PAYLOAD_SIZE};

/// Builder for configuring and creating a [`Link`].
#[derive(Debug, Clone)]
pub struct LinkBuilder {
    role: Role,
    max_payload_size: u32,
    default_timeout: Option<Duration>,
}

impl LinkBuilder {
    /// Create a new builder.
    ///
    /// Defaults: `Role::Client`, 64 KiB payload cap, 10 s request timeout.
    pub fn new() -> Self {
        Self {
            role: Role::default(),
            max_payload_size: MAX_PAYLOAD_SIZE,
            default_timeout: Some(DEFAULT_TIMEOUT),
        }
    }

    /// Set which side of the channel this link serves.
    pub fn role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Set the largest inbound payload accepted per frame.
    pub fn max_payload_size(mut self, max: u32) -> Self {
        self.max_payload_size = max;
        self
    }

    /// Set the timeout attached to every request from
    /// [`Link::register_request`].
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Do not attach timeouts automatically.
    pub fn no_timeout(mut self) -> Self {
        self.default_timeout = None;
        self
    }

    /// Build the link.
    pub fn build(self) -> Link {
        let codec = FrameCodec::with_max_payload(self.role, self.max_payload_size);
        Link {
            buffer: codec.frame_buffer(),
            codec,
            registry: CorrelationRegistry::new(),
            default_timeout: self.default_timeout,
            authenticated: false,
        }
    }
}

impl Default for LinkBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct ResponseBody {
    id: u64,
    #[serde(default)]
    result: Value,
}

#[derive(Deserialize)]
struct ErrorBody {
    id: u64,
    #[serde(default)]
    error: Value,
}

#[derive(Deserialize)]
struct PromiseBody {
    id: u64,
    checksum: String,
}

/// One end of a framed request/response channel.
pub struct Link {
    codec: FrameCodec,
    buffer: FrameBuffer,
    registry: CorrelationRegistry,
    default_timeout: Option<Duration>,
    authenticated: bool,
}

impl Link {
    /// Create a new link builder.
    pub fn builder() -> LinkBuilder {
        LinkBuilder::new()
    }

    /// Create a link with default settings for `role`.
    pub fn new(role: Role) -> Self {
        LinkBuilder::new().role(role).build()
    }

    /// Encode a message for the transport.
    ///
    /// `kind == "binary"` takes bytes, any other kind takes JSON.
    pub fn send(&self, kind: &str, data: impl Into<Outgoing>) -> Result<Bytes> {
        self.codec.encode(kind, data.into()).map(Bytes::from)
    }

    /// Feed an inbound chunk. Complete frames are decoded and routed;
    /// envelopes the link does not consume are returned in arrival order.
    pub fn on_frame(&mut self, bytes: &[u8]) -> Vec<Envelope> {
        self.buffer
            .push(bytes)
            .into_iter()
            .filter_map(Message::from_frame)
            .filter_map(|message| self.route(message))
            .collect()
    }

    fn route(&mut self, message: Message) -> Option<Envelope> {
        let envelope = match message {
            Message::Binary(bytes) => {
                self.submit_binary(bytes);
                return None;
            }
            Message::Control(envelope) => envelope,
        };

        match envelope.kind.as_str() {
            tags::AUTHENTICATED => {
                tracing::info!("link authenticated");
                self.authenticated = true;
            }
            tags::RESPONSE => {
                if let Some(body) = routing_body::<ResponseBody>(&envelope) {
                    self.complete_request(body.id, body.result);
                }
            }
            tags::ERROR => {
                if let Some(body) = routing_body::<ErrorBody>(&envelope) {
                    self.fail_request(body.id, body.error);
                }
            }
            tags::CHECKSUM_PROMISE => {
                if let Some(body) = routing_body::<PromiseBody>(&envelope) {
                    self.complete_request(body.id, json!({ "checksum": body.checksum }));
                }
            }
            _ => return Some(envelope),
        }
        None
    }

    /// Register an outgoing request; the default timeout is attached when
    /// configured and a tokio runtime is available.
    pub fn register_request(&self, name: &str) -> (u64, PendingReply) {
        let (id, reply) = self.registry.register_request(name);
        if let Some(timeout) = self.default_timeout {
            self.registry.attach_timeout(id, timeout);
        }
        (id, reply)
    }

    /// Complete request `id`. See [`CorrelationRegistry::resolve`].
    pub fn complete_request(&self, id: u64, result: Value) {
        self.registry.resolve(id, result);
    }

    /// Fail request `id` with a remote error.
    pub fn fail_request(&self, id: u64, error: Value) {
        self.registry.reject(id, error);
    }

    /// Deliver a binary payload to whichever request announced its checksum.
    pub fn submit_binary(&self, bytes: Bytes) -> BinaryDisposition {
        self.registry.resolve_binary_data(bytes)
    }

    /// Encode a successful reply to request `id`.
    pub fn respond<T: Serialize>(&self, id: u64, result: &T) -> Result<Bytes> {
        self.codec.encode_response(id, result).map(Bytes::from)
    }

    /// Encode a failed reply to request `id`.
    pub fn respond_error<T: Serialize>(&self, id: u64, error: &T) -> Result<Bytes> {
        self.codec.encode_error(id, error).map(Bytes::from)
    }

    /// Encode a binary reply as `(promise, data)` frames. They may be
    /// delivered in either order.
    pub fn respond_binary(&self, id: u64, data: &[u8]) -> Result<(Bytes, Bytes)> {
        let promise = self.codec.encode_promise(id, &Checksum::of(data))?;
        let binary = self.codec.encode_binary(data)?;
        Ok((Bytes::from(promise), Bytes::from(binary)))
    }

    /// Shared registry handle.
    pub fn registry(&self) -> &CorrelationRegistry {
        &self.registry
    }

    pub fn codec(&self) -> FrameCodec {
        self.codec
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    /// Whether an `authenticated` envelope has been received.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Frames dropped as malformed so far.
    pub fn dropped_frames(&self) -> u64 {
        self.buffer.dropped()
    }
}

fn routing_body<T: serde::de::DeserializeOwned>(envelope: &Envelope) -> Option<T> {
    match serde_json::from_value(envelope.payload.clone()) {
        Ok(body) => Some(body),
        Err(e) => {
            tracing::warn!(kind = %envelope.kind, error = %e, "dropping envelope without routable id");
            None
        }
    }
}
