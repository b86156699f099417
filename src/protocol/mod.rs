//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the byte-level protocol:
//! - 6-byte header with optional 4-byte XOR mask key
//! - Frame buffer for accumulating partial reads
//! - Frame struct with typed accessors

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::{apply_mask, build_frame, Frame};
pub use frame_buffer::FrameBuffer;
pub(crate) use frame_buffer::finish_frame;
pub use wire_format::{
    flags, Header, HeaderFault, Opcode, HEADER_SIZE, MASK_KEY_SIZE, MAX_PAYLOAD_SIZE,
};
