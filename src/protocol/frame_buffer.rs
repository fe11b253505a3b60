//! Incremental frame decoder.
//!
//! Transport reads return arbitrary slices of the byte stream, so the
//! decoder keeps whatever it has not consumed yet in a `BytesMut` and moves
//! through three states:
//! - `Prefix`: fewer than 3 unread bytes, no length known yet
//! - `Payload`: length accepted, waiting until that many bytes are buffered
//! - `Poisoned`: a declared length was over the limit; the stream position
//!   can no longer be trusted and every call fails until `clear`
//!
//! # Example
//!
//! ```
//! use wasession::protocol::{build_frame, FrameBuffer};
//!
//! let wire = build_frame(b"abc").unwrap();
//! let mut frames = FrameBuffer::new();
//!
//! assert!(frames.push(&wire[..2]).unwrap().is_empty());
//! let ready = frames.push(&wire[2..]).unwrap();
//! assert_eq!(ready[0].payload(), b"abc");
//! ```

use bytes::{Buf, BytesMut};

use super::wire_format::{decode_length, validate_length, FRAME_LENGTH_SIZE, FRAME_MAX_SIZE};
use super::Frame;
use crate::error::{Result, SessionError};

/// Initial capacity of the unread-bytes buffer (64KB).
const INITIAL_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Prefix,
    Payload { len: usize },
    Poisoned { declared: usize },
}

/// Accumulates stream bytes and cuts them into [`Frame`]s.
///
/// Oversized lengths are rejected as soon as the prefix is read, before any
/// of the payload is buffered.
pub struct FrameBuffer {
    unread: BytesMut,
    state: DecodeState,
    max_frame_size: usize,
}

impl FrameBuffer {
    /// Decoder accepting payloads up to `FRAME_MAX_SIZE`.
    pub fn new() -> Self {
        Self::with_max_frame_size(FRAME_MAX_SIZE)
    }

    /// Decoder accepting payloads up to `max_frame_size` bytes.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            unread: BytesMut::with_capacity(INITIAL_CAPACITY),
            state: DecodeState::Prefix,
            max_frame_size,
        }
    }

    /// Append `data` and return every frame it completes.
    ///
    /// # Errors
    ///
    /// `FrameTooLarge` once a declared length is over the limit. Frames
    /// completed before the bad prefix in the same call are still returned;
    /// the decoder is then poisoned and the error comes from the next call.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.extend(data);
        let mut frames = Vec::new();
        loop {
            match self.decode_next() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => return Ok(frames),
                Err(e) if frames.is_empty() => return Err(e),
                Err(_) => return Ok(frames),
            }
        }
    }

    /// Cut the next frame out of the buffered bytes, if it is complete.
    pub fn decode_next(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.state {
                DecodeState::Poisoned { declared } => {
                    return Err(SessionError::FrameTooLarge {
                        size: declared,
                        max: self.max_frame_size,
                    });
                }
                DecodeState::Prefix => {
                    let Some(len) = decode_length(&self.unread) else {
                        return Ok(None);
                    };
                    if let Err(e) = validate_length(len, self.max_frame_size) {
                        self.state = DecodeState::Poisoned { declared: len };
                        return Err(e);
                    }
                    self.unread.advance(FRAME_LENGTH_SIZE);
                    self.state = DecodeState::Payload { len };
                }
                DecodeState::Payload { len } => {
                    if self.unread.len() < len {
                        self.unread.reserve(len - self.unread.len());
                        return Ok(None);
                    }
                    self.state = DecodeState::Prefix;
                    return Ok(Some(Frame::new(self.unread.split_to(len).freeze())));
                }
            }
        }
    }

    /// Buffer `data` without decoding. Ignored once poisoned.
    pub fn extend(&mut self, data: &[u8]) {
        if !self.is_corrupt() {
            self.unread.extend_from_slice(data);
        }
    }

    /// Buffered bytes not yet returned as a frame (excluding a consumed prefix).
    pub fn len(&self) -> usize {
        self.unread.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.unread.is_empty()
    }

    /// Whether an oversized length has poisoned the decoder.
    pub fn is_corrupt(&self) -> bool {
        matches!(self.state, DecodeState::Poisoned { .. })
    }

    /// Drop all buffered bytes and start over at a frame boundary.
    pub fn clear(&mut self) {
        self.unread.clear();
        self.state = DecodeState::Prefix;
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
