//! Protocol module - connection header, framing, and frame types.
//!
//! This module implements the frame envelope of the chat socket:
//! - One-time connection header (magic tag + Noise prologue)
//! - 3-byte big-endian length prefix per frame
//! - Frame buffer for accumulating partial reads

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::{build_frame, build_frame_parts, Frame};
pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    decode_length, encode_conn_header, encode_length, validate_length, CONN_HEADER,
    CONN_HEADER_SIZE, DICT_VERSION, FRAME_LENGTH_SIZE, FRAME_MAX_SIZE, MAGIC_VALUE,
    NOISE_START_PATTERN, ORIGIN, URL,
};
