//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForHeader`: need the 6-byte header (10 when masked)
//! - `WaitingForPayload`: header accepted, need N more payload bytes
//! - `Skipping`: header rejected but length known, discard N bytes
//!
//! Unlike a strict parser, the buffer never fails: a frame that breaks the
//! rules is dropped and the stream carries on. A frame over the size cap is
//! skipped by its declared length. Only when the header is too broken to know
//! where the next frame starts (unknown opcode, negative length) is
//! everything buffered discarded.
//!
//! # Example
//!
//! ```
//! use imgwire::protocol::{build_frame, FrameBuffer, Header, Opcode};
//!
//! let mut buffer = FrameBuffer::new();
//! let bytes = build_frame(&Header::new(Opcode::Binary, 3), b"abc");
//!
//! assert!(buffer.push(&bytes[..4]).is_empty());
//! let frames = buffer.push(&bytes[4..]);
//! assert_eq!(frames[0].payload(), b"abc");
//! ```

use bytes::BytesMut;

use super::frame::apply_mask;
use super::wire_format::{
    flags, Header, HeaderFault, Opcode, HEADER_SIZE, MASK_KEY_SIZE, MAX_PAYLOAD_SIZE,
};
use super::Frame;

/// State machine for frame parsing.
#[derive(Debug, Clone, Copy)]
enum State {
    WaitingForHeader,
    WaitingForPayload { header: Header, remaining: usize },
    Skipping { remaining: usize },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed payload size.
    max_payload_size: u32,
    /// Drop frames that arrive without a mask key.
    require_mask: bool,
    /// Frames dropped since creation.
    dropped: u64,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max payload: 64KB, mask not required.
    pub fn new() -> Self {
        Self::with_policy(MAX_PAYLOAD_SIZE, false)
    }

    /// Create a frame buffer with a custom payload cap and mask requirement.
    pub fn with_policy(max_payload_size: u32, require_mask: bool) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            max_payload_size,
            require_mask,
            dropped: 0,
        }
    }

    /// Push data into the buffer and extract all complete, acceptable frames.
    ///
    /// Partial data is kept for the next push. Rejected frames are counted
    /// in [`dropped`](Self::dropped) and otherwise ignored.
    pub fn push(&mut self, data: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(step) = self.step() {
            if let Some(frame) = step {
                frames.push(frame);
            }
        }
        frames
    }

    /// Advance the state machine by one transition.
    ///
    /// Returns:
    /// - `Some(Some(frame))` when a frame was completed
    /// - `Some(None)` when progress was made without producing a frame
    /// - `None` when more data is needed
    fn step(&mut self) -> Option<Option<Frame>> {
        match self.state {
            State::WaitingForHeader => {
                if self.buffer.is_empty() {
                    return None;
                }
                if Opcode::from_u8(self.buffer[0]).is_none() {
                    tracing::warn!(
                        opcode = self.buffer[0],
                        discarded = self.buffer.len(),
                        "unknown opcode, discarding buffered input"
                    );
                    self.discard_all();
                    return Some(None);
                }
                if self.buffer.len() < HEADER_SIZE {
                    return None;
                }
                let needed = if flags::has_flag(self.buffer[1], flags::MASKED) {
                    HEADER_SIZE + MASK_KEY_SIZE
                } else {
                    HEADER_SIZE
                };
                if self.buffer.len() < needed {
                    return None;
                }

                let header = Header::decode(&self.buffer[..needed])?;
                let _ = self.buffer.split_to(needed);

                match header.admit(self.max_payload_size, self.require_mask) {
                    Ok(()) => {
                        self.state = State::WaitingForPayload {
                            header,
                            remaining: header.payload_length as usize,
                        };
                    }
                    Err(
                        fault @ (HeaderFault::TooLarge
                        | HeaderFault::MissingMask
                        | HeaderFault::ReservedFlags),
                    ) => {
                        tracing::debug!(?fault, length = header.payload_length, "skipping frame");
                        self.dropped += 1;
                        self.state = State::Skipping {
                            remaining: header.payload_length as usize,
                        };
                    }
                    Err(fault) => {
                        tracing::warn!(
                            ?fault,
                            length = header.payload_length,
                            "negative frame length, discarding buffered input"
                        );
                        self.discard_all();
                    }
                }
                Some(None)
            }

            State::WaitingForPayload { header, remaining } => {
                if self.buffer.len() < remaining {
                    return None;
                }
                let payload = self.buffer.split_to(remaining);
                self.state = State::WaitingForHeader;
                Some(Some(finish_frame(&header, payload)))
            }

            State::Skipping { remaining } => {
                let n = remaining.min(self.buffer.len());
                let _ = self.buffer.split_to(n);
                if n == remaining {
                    self.state = State::WaitingForHeader;
                    Some(None)
                } else {
                    self.state = State::Skipping {
                        remaining: remaining - n,
                    };
                    None
                }
            }
        }
    }

    fn discard_all(&mut self) {
        self.dropped += 1;
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    /// Number of frames dropped as malformed.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Get the current state for debugging.
    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForPayload { .. } => "WaitingForPayload",
            State::Skipping { .. } => "Skipping",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Unmask (if needed) and wrap the payload.
pub(crate) fn finish_frame(header: &Header, mut payload: BytesMut) -> Frame {
    if let Some(key) = header.mask_key {
        apply_mask(&mut payload, key);
    }
    Frame::new(header.opcode, payload.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::build_frame;

    fn make_frame_bytes(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
        build_frame(&Header::new(opcode, payload.len() as i32), payload)
    }

    fn make_masked_frame_bytes(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
        build_frame(
            &Header::masked(opcode, payload.len() as i32, [0x12, 0x34, 0x56, 0x78]),
            payload,
        )
    }

    #[test]
    fn test_single_complete_frame() {
        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&make_frame_bytes(Opcode::Text, b"hello"));

        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_text());
        assert_eq!(frames[0].payload(), b"hello");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buffer = FrameBuffer::new();

        let mut combined = make_frame_bytes(Opcode::Text, b"first");
        combined.extend(make_masked_frame_bytes(Opcode::Binary, b"second"));
        combined.extend(make_frame_bytes(Opcode::Binary, b""));

        let frames = buffer.push(&combined);

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].payload(), b"first");
        assert_eq!(frames[1].payload(), b"second");
        assert!(frames[2].payload().is_empty());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fragmented_masked_header() {
        let mut buffer = FrameBuffer::new();
        let bytes = make_masked_frame_bytes(Opcode::Binary, b"data");

        // Base header complete, mask key not yet
        assert!(buffer.push(&bytes[..HEADER_SIZE + 2]).is_empty());
        assert_eq!(buffer.state_name(), "WaitingForHeader");

        let frames = buffer.push(&bytes[HEADER_SIZE + 2..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), b"data");
    }

    #[test]
    fn test_fragmented_payload() {
        let mut buffer = FrameBuffer::new();
        let payload = b"this is a longer payload that will be fragmented";
        let bytes = make_frame_bytes(Opcode::Binary, payload);

        let partial_len = HEADER_SIZE + 10;
        assert!(buffer.push(&bytes[..partial_len]).is_empty());
        assert_eq!(buffer.state_name(), "WaitingForPayload");

        let frames = buffer.push(&bytes[partial_len..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), payload);
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = FrameBuffer::new();
        let bytes = make_masked_frame_bytes(Opcode::Text, b"hi");

        let mut all_frames = Vec::new();
        for byte in &bytes {
            all_frames.extend(buffer.push(&[*byte]));
        }

        assert_eq!(all_frames.len(), 1);
        assert_eq!(all_frames[0].payload(), b"hi");
    }

    #[test]
    fn test_oversized_frame_skipped_by_length() {
        let mut buffer = FrameBuffer::new();

        let mut combined = make_frame_bytes(Opcode::Binary, &vec![0u8; 70_000]);
        combined.extend(make_frame_bytes(Opcode::Text, b"next"));

        let frames = buffer.push(&combined);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), b"next");
        assert_eq!(buffer.dropped(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_oversized_tail_not_parsed_as_frames() {
        let mut buffer = FrameBuffer::new();

        // Tail of the oversized payload looks like a valid binary frame.
        let mut payload = vec![0u8; 70_000];
        payload[60_000..60_009].copy_from_slice(&[2, 0, 0, 0, 0, 3, b'x', b'y', b'z']);
        let bytes = make_frame_bytes(Opcode::Binary, &payload);

        assert!(buffer.push(&bytes[..HEADER_SIZE + 60_000]).is_empty());
        assert_eq!(buffer.state_name(), "Skipping");
        assert!(buffer.push(&bytes[HEADER_SIZE + 60_000..]).is_empty());
        assert_eq!(buffer.state_name(), "WaitingForHeader");
        assert_eq!(buffer.dropped(), 1);

        let frames = buffer.push(&make_frame_bytes(Opcode::Text, b"after"));
        assert_eq!(frames[0].payload(), b"after");
    }

    #[test]
    fn test_negative_length_dropped() {
        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&Header::new(Opcode::Text, -5).encode());

        assert!(frames.is_empty());
        assert_eq!(buffer.dropped(), 1);
    }

    #[test]
    fn test_unmasked_frame_skipped_when_mask_required() {
        let mut buffer = FrameBuffer::with_policy(MAX_PAYLOAD_SIZE, true);

        let mut combined = make_frame_bytes(Opcode::Text, b"unmasked");
        combined.extend(make_masked_frame_bytes(Opcode::Text, b"masked"));

        let frames = buffer.push(&combined);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), b"masked");
        assert_eq!(buffer.dropped(), 1);
    }

    #[test]
    fn test_skipping_across_pushes() {
        let mut buffer = FrameBuffer::with_policy(MAX_PAYLOAD_SIZE, true);
        let bytes = make_frame_bytes(Opcode::Binary, &[7u8; 32]);

        assert!(buffer.push(&bytes[..HEADER_SIZE + 8]).is_empty());
        assert_eq!(buffer.state_name(), "Skipping");

        assert!(buffer.push(&bytes[HEADER_SIZE + 8..]).is_empty());
        assert_eq!(buffer.state_name(), "WaitingForHeader");
    }

    #[test]
    fn test_unknown_opcode_discards() {
        let mut buffer = FrameBuffer::new();
        assert!(buffer.push(&[0x09, 0, 0, 0, 0, 1, 0xFF]).is_empty());
        assert!(buffer.is_empty());
        assert_eq!(buffer.dropped(), 1);
    }}
