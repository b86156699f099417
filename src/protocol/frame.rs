//! Frame struct with typed accessors.
//!
//! A [`Frame`] is what the decoder hands out: the opcode plus the already
//! unmasked payload, shared via `bytes::Bytes`.
//!
//! # Example
//!
//! ```
//! use imgwire::protocol::{Frame, Opcode};
//! use bytes::Bytes;
//!
//! let frame = Frame::new(Opcode::Binary, Bytes::from_static(b"pixels"));
//! assert!(frame.is_binary());
//! assert_eq!(frame.payload(), b"pixels");
//! ```

use bytes::Bytes;

use super::wire_format::{Header, Opcode, MASK_KEY_SIZE};

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    /// Unmasked payload bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from opcode and payload.
    pub fn new(opcode: Opcode, payload: Bytes) -> Self {
        Self { opcode, payload }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Check if this frame carries a JSON envelope.
    #[inline]
    pub fn is_text(&self) -> bool {
        self.opcode == Opcode::Text
    }

    /// Check if this frame carries raw binary data.
    #[inline]
    pub fn is_binary(&self) -> bool {
        self.opcode == Opcode::Binary
    }
}

/// XOR `data` in place with `key[i % 4]`.
///
/// Masking is its own inverse, so this both masks and unmasks.
pub fn apply_mask(data: &mut [u8], key: [u8; MASK_KEY_SIZE]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % MASK_KEY_SIZE];
    }
}

/// Build a complete frame as a single byte vector.
///
/// Encodes the header and appends the payload, masking it with the
/// header's key when one is present.
///
/// # Example
///
/// ```
/// use imgwire::protocol::{build_frame, Header, Opcode, HEADER_SIZE};
///
/// let header = Header::new(Opcode::Binary, 5);
/// let bytes = build_frame(&header, b"hello");
/// assert_eq!(bytes.len(), HEADER_SIZE + 5);
/// ```
pub fn build_frame(header: &Header, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(header.data_start() + payload.len());
    header.encode_into(&mut buf);
    let start = buf.len();
    buf.extend_from_slice(payload);
    if let Some(key) = header.mask_key {
        apply_mask(&mut buf[start..], key);
    }
    buf
}
