//! Wire format encoding and decoding.
//!
//! A physical connection starts with a one-time connection header, then
//! carries length-prefixed frames:
//! ```text
//! header (once):  'W' 'A' 0x05 0x02 || "Noise_XX_25519_AESGCM_SHA256\0\0\0\0"
//!
//! ┌──────────────┬───────────────────┐
//! │ Length       │ Payload           │
//! │ 3 bytes      │ Length bytes      │
//! │ uint24 BE    │                   │
//! └──────────────┴───────────────────┘
//! ```

use crate::error::{Result, SessionError};

/// Origin header for all websocket connections.
pub const ORIGIN: &str = "https://web.whatsapp.com";

/// Websocket URL for the multidevice protocol.
pub const URL: &str = "wss://web.whatsapp.com/ws/chat";

/// Noise handshake prologue, padded to 32 bytes.
pub const NOISE_START_PATTERN: &[u8; 32] = b"Noise_XX_25519_AESGCM_SHA256\x00\x00\x00\x00";

/// Binary dictionary version advertised in the header.
pub const DICT_VERSION: u8 = 2;

/// Magic value advertised in the header.
pub const MAGIC_VALUE: u8 = 5;

/// The 4-byte magic tag that opens every connection.
pub const CONN_HEADER: [u8; 4] = [b'W', b'A', MAGIC_VALUE, DICT_VERSION];

/// Total connection header size (magic tag + prologue).
pub const CONN_HEADER_SIZE: usize = CONN_HEADER.len() + NOISE_START_PATTERN.len();

/// Maximum frame size. Payloads must be strictly smaller on encode.
pub const FRAME_MAX_SIZE: usize = 2 << 23;

/// Length prefix size in bytes.
pub const FRAME_LENGTH_SIZE: usize = 3;

/// Build the connection header sent once per physical connection.
///
/// # Example
///
/// ```
/// use wasession::protocol::{encode_conn_header, CONN_HEADER_SIZE};
///
/// let header = encode_conn_header();
/// assert_eq!(header.len(), CONN_HEADER_SIZE);
/// assert_eq!(&header[..2], b"WA");
/// ```
pub fn encode_conn_header() -> [u8; CONN_HEADER_SIZE] {
    let mut buf = [0u8; CONN_HEADER_SIZE];
    buf[..CONN_HEADER.len()].copy_from_slice(&CONN_HEADER);
    buf[CONN_HEADER.len()..].copy_from_slice(NOISE_START_PATTERN);
    buf
}

/// Encode a payload length as a 3-byte big-endian prefix.
///
/// Fails with `FrameTooLarge` if the length cannot be represented,
/// i.e. `len >= FRAME_MAX_SIZE`.
pub fn encode_length(len: usize) -> Result<[u8; FRAME_LENGTH_SIZE]> {
    if len >= FRAME_MAX_SIZE {
        return Err(SessionError::FrameTooLarge {
            size: len,
            max: FRAME_MAX_SIZE,
        });
    }
    Ok([(len >> 16) as u8, (len >> 8) as u8, len as u8])
}

/// Decode a 3-byte big-endian length prefix.
///
/// Returns `None` if buffer is too short.
///
/// # Example
///
/// ```
/// use wasession::protocol::decode_length;
///
/// assert_eq!(decode_length(&[0x01, 0x00, 0x02]), Some(65538));
/// assert_eq!(decode_length(&[0x01]), None);
/// ```
pub fn decode_length(buf: &[u8]) -> Option<usize> {
    if buf.len() < FRAME_LENGTH_SIZE {
        return None;
    }
    Some((usize::from(buf[0]) << 16) | (usize::from(buf[1]) << 8) | usize::from(buf[2]))
}

/// Check a declared payload length against the configured maximum.
pub fn validate_length(len: usize, max_frame_size: usize) -> Result<()> {
    if len > max_frame_size {
        return Err(SessionError::FrameTooLarge {
            size: len,
            max: max_frame_size,
        });
    }
    Ok(())
}
