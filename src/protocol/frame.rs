//! Frame struct and frame encoding.
//!
//! A frame is one length-delimited protocol message. The payload is opaque
//! here (it is Noise ciphertext, or a handshake message, decoded elsewhere).
//!
//! # Example
//!
//! ```
//! use wasession::protocol::{build_frame, FrameBuffer};
//!
//! let bytes = build_frame(b"hello").unwrap();
//! assert_eq!(bytes.len(), 3 + 5);
//!
//! let mut buffer = FrameBuffer::new();
//! let frames = buffer.push(&bytes).unwrap();
//! assert_eq!(frames[0].payload(), b"hello");
//! ```

use bytes::Bytes;

use super::wire_format::{encode_length, FRAME_LENGTH_SIZE};
use crate::error::Result;

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Opaque payload (Noise ciphertext or a handshake message).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from a payload.
    pub fn new(payload: Bytes) -> Self {
        Self { payload }
    }

    /// Create a frame from raw bytes (copies data).
    pub fn from_slice(payload: &[u8]) -> Self {
        Self {
            payload: Bytes::copy_from_slice(payload),
        }
    }

    /// Payload as a slice.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload handle sharing the same buffer.
    #[inline]
    pub fn payload_bytes(&self) -> Bytes {
        self.payload.clone()
    }

    /// Payload length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Check if the payload is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Size of this frame on the wire (prefix + payload).
    #[inline]
    pub fn wire_size(&self) -> usize {
        FRAME_LENGTH_SIZE + self.payload.len()
    }
}

/// Encode `payload` as prefix followed by payload in one buffer.
///
/// Fails with `FrameTooLarge` before allocating anything if the payload
/// cannot be length-prefixed. Use `build_frame_parts` for writev-style I/O.
pub fn build_frame(payload: &[u8]) -> Result<Vec<u8>> {
    let prefix = encode_length(payload.len())?;
    let mut buf = Vec::with_capacity(FRAME_LENGTH_SIZE + payload.len());
    buf.extend_from_slice(&prefix);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Length prefix for `payload`, paired with the payload itself, for
/// vectored writes that avoid copying into one buffer.
pub fn build_frame_parts(payload: &[u8]) -> Result<([u8; FRAME_LENGTH_SIZE], &[u8])> {
    Ok((encode_length(payload.len())?, payload))
}
