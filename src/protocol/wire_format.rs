//! Wire format encoding and decoding.
//!
//! Implements the 6-byte header, optionally followed by a 4-byte mask key:
//! ```text
//! ┌────────┬───────┬──────────┬────────────┐
//! │ Opcode │ Flags │ Length   │ Mask key   │
//! │ 1 byte │ 1 byte│ int32 BE │ 0 / 4 bytes│
//! └────────┴───────┴──────────┴────────────┘
//! ```
//!
//! The length field is signed so that a corrupt header can carry a negative
//! value; such frames are rejected by [`Header::validate`].

/// Fixed header size in bytes (without mask key).
pub const HEADER_SIZE: usize = 6;

/// Size of the XOR mask key.
pub const MASK_KEY_SIZE: usize = 4;

/// Maximum payload size accepted on decode (64 KiB).
pub const MAX_PAYLOAD_SIZE: u32 = 65_536;

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// UTF-8 JSON envelope.
    Text = 1,
    /// Raw binary payload.
    Binary = 2,
}

impl Opcode {
    /// Parse an opcode byte.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Opcode::Text),
            2 => Some(Opcode::Binary),
            _ => None,
        }
    }
}

/// Flag constants for the protocol.
pub mod flags {
    /// Payload is XOR-masked; a 4-byte key follows the header.
    pub const MASKED: u8 = 0b0000_0001;

    /// Reserved bits mask (bits 1-7).
    pub const RESERVED_MASK: u8 = 0b1111_1110;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }
}

/// Reasons a header is not acceptable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderFault {
    /// Negative length field.
    NegativeLength,
    /// Length above the configured maximum.
    TooLarge,
    /// Reserved flag bits set.
    ReservedFlags,
    /// Receiver requires masking but the frame carries no key.
    MissingMask,
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub opcode: Opcode,
    pub flags: u8,
    /// Declared payload length; may be negative on a corrupt frame.
    pub payload_length: i32,
    /// Mask key, present iff the MASKED flag is set.
    pub mask_key: Option<[u8; MASK_KEY_SIZE]>,
}

impl Header {
    /// Create an unmasked header.
    pub fn new(opcode: Opcode, payload_length: i32) -> Self {
        Self {
            opcode,
            flags: 0,
            payload_length,
            mask_key: None,
        }
    }

    /// Create a masked header.
    pub fn masked(opcode: Opcode, payload_length: i32, mask_key: [u8; MASK_KEY_SIZE]) -> Self {
        Self {
            opcode,
            flags: flags::MASKED,
            payload_length,
            mask_key: Some(mask_key),
        }
    }

    /// Number of header bytes on the wire, i.e. where payload data starts.
    #[inline]
    pub fn data_start(&self) -> usize {
        if self.mask_key.is_some() {
            HEADER_SIZE + MASK_KEY_SIZE
        } else {
            HEADER_SIZE
        }
    }

    /// Check if the payload is masked.
    #[inline]
    pub fn is_masked(&self) -> bool {
        self.mask_key.is_some()
    }

    /// Encode header (and mask key, if any) to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use imgwire::protocol::{Header, Opcode};
    ///
    /// let header = Header::masked(Opcode::Text, 100, [1, 2, 3, 4]);
    /// assert_eq!(header.encode().len(), 10);
    /// ```
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.data_start());
        self.encode_into(&mut buf);
        buf
    }

    /// Append the encoded header to an existing buffer.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let flags = match self.mask_key {
            Some(_) => self.flags | flags::MASKED,
            None => self.flags & !flags::MASKED,
        };
        buf.push(self.opcode as u8);
        buf.push(flags);
        buf.extend_from_slice(&self.payload_length.to_be_bytes());
        if let Some(key) = self.mask_key {
            buf.extend_from_slice(&key);
        }
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if the buffer is too short for the header (including
    /// the mask key when the MASKED flag is set) or the opcode is unknown.
    ///
    /// # Example
    ///
    /// ```
    /// use imgwire::protocol::{Header, Opcode};
    ///
    /// let bytes = [2, 0, 0, 0, 0, 100];
    /// let header = Header::decode(&bytes).unwrap();
    /// assert_eq!(header.opcode, Opcode::Binary);
    /// assert_eq!(header.payload_length, 100);
    /// ```
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        let opcode = Opcode::from_u8(buf[0])?;
        let flags = buf[1];
        let payload_length = i32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);

        let mask_key = if flags::has_flag(flags, flags::MASKED) {
            if buf.len() < HEADER_SIZE + MASK_KEY_SIZE {
                return None;
            }
            Some([buf[6], buf[7], buf[8], buf[9]])
        } else {
            None
        };

        Some(Self {
            opcode,
            flags,
            payload_length,
            mask_key,
        })
    }

    /// Validate the header against the length cap and reserved bits.
    pub fn validate(&self, max_payload_size: u32) -> Result<(), HeaderFault> {
        if self.payload_length < 0 {
            return Err(HeaderFault::NegativeLength);
        }
        if self.payload_length as u32 > max_payload_size {
            return Err(HeaderFault::TooLarge);
        }
        if self.flags & flags::RESERVED_MASK != 0 {
            return Err(HeaderFault::ReservedFlags);
        }
        Ok(())
    }

    /// Full acceptance check used by receivers: [`validate`](Self::validate)
    /// plus the mask requirement of the receiving role.
    pub fn admit(&self, max_payload_size: u32, require_mask: bool) -> Result<(), HeaderFault> {
        self.validate(max_payload_size)?;
        if require_mask && !self.is_masked() {
            return Err(HeaderFault::MissingMask);
        }
        Ok(())
    }
}
