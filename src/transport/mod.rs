//! Transport module - framed socket over a duplex byte stream.
//!
//! The physical transport (a websocket in production, `tokio::io::duplex`
//! in tests) is anything implementing `AsyncRead + AsyncWrite`.

mod socket;

pub use socket::{FrameSocket, FrameStream, SocketConfig, SocketState, DEFAULT_READ_BUFFER_SIZE};
