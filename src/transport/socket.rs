//! Framed socket over a duplex byte stream.
//!
//! The socket owns one physical connection at a time:
//! 1. `open` writes the connection header and spawns the writer task
//! 2. `send_frame` length-prefixes a payload and queues it on the writer
//! 3. The returned [`FrameStream`] reads bytes and yields whole frames
//! 4. `close` (or any transport / framing failure) returns it to `Closed`;
//!    the stream tells the two apart by ending with `None` or with an `Err`
//!
//! # Example
//!
//! ```ignore
//! use wasession::transport::{FrameSocket, SocketConfig};
//!
//! let socket = FrameSocket::new(SocketConfig::default());
//! let mut frames = socket.open(websocket_stream).await?;
//!
//! socket.send_frame(handshake_hello).await?;
//! while let Some(frame) = frames.next().await {
//!     let frame = frame?;
//!     // hand frame.payload to the noise / node decoder
//! }
//! ```

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::sync::{watch, Mutex};

use crate::error::{Result, SessionError};
use crate::protocol::{encode_conn_header, Frame, FrameBuffer, FRAME_MAX_SIZE};
use crate::writer::{spawn_writer_task, OutboundFrame, WriterConfig, WriterHandle};

/// Default read buffer size (64KB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Open/closed state of a [`FrameSocket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// No physical connection.
    Closed,
    /// Header sent, frames may flow.
    Open,
}

/// Configuration for a [`FrameSocket`].
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Largest inbound payload accepted before the stream is treated as corrupt.
    pub max_frame_size: usize,
    /// Size of each transport read.
    pub read_buffer_size: usize,
    /// Writer task settings.
    pub writer: WriterConfig,
}

impl SocketConfig {
    /// Set the maximum inbound frame size.
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Set the transport read buffer size.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Set the writer task configuration.
    pub fn writer(mut self, writer: WriterConfig) -> Self {
        self.writer = writer;
        self
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            max_frame_size: FRAME_MAX_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            writer: WriterConfig::default(),
        }
    }
}

/// Why a connection was closed, as seen by its [`FrameStream`].
#[derive(Debug, Clone)]
enum CloseReason {
    /// `close()` was called.
    Local,
    /// Transport or framing failure on either half.
    Failed {
        kind: io::ErrorKind,
        message: String,
    },
}

impl CloseReason {
    fn write_failed(error: &SessionError) -> Self {
        let kind = match error {
            SessionError::Io(e) => e.kind(),
            _ => io::ErrorKind::Other,
        };
        Self::Failed {
            kind,
            message: format!("write failed: {error}"),
        }
    }
}

type CloseSender = watch::Sender<Option<CloseReason>>;

/// Live connection bookkeeping.
struct OpenConnection {
    writer: WriterHandle,
    closed_tx: CloseSender,
    generation: u64,
}

/// Connection slot. `Opening` covers the header write, which runs without
/// the lock so `close` and `state` never wait on a stalled transport.
enum Slot {
    Closed,
    Opening {
        generation: u64,
        closed_tx: CloseSender,
    },
    Open(OpenConnection),
}

impl Slot {
    fn generation(&self) -> Option<u64> {
        match self {
            Slot::Closed => None,
            Slot::Opening { generation, .. } => Some(*generation),
            Slot::Open(open) => Some(open.generation),
        }
    }

    /// Move to `Closed` and wake the connection's stream with `reason`.
    fn close(&mut self, reason: CloseReason) {
        let closed_tx = match std::mem::replace(self, Slot::Closed) {
            Slot::Closed => return,
            Slot::Opening { closed_tx, .. } => closed_tx,
            Slot::Open(open) => open.closed_tx,
        };
        closed_tx.send_replace(Some(reason));
    }
}

struct Shared {
    slot: Mutex<Slot>,
    generation: AtomicU64,
}

impl Shared {
    /// Close the connection if it is still the one identified by `generation`.
    async fn close_generation(&self, generation: u64, reason: CloseReason) {
        let mut slot = self.slot.lock().await;
        if slot.generation() == Some(generation) {
            tracing::warn!("Closing frame socket: {:?}", reason);
            slot.close(reason);
        }
    }
}

/// Length-prefixed frame socket.
///
/// Cloning gives another handle to the same socket.
#[derive(Clone)]
pub struct FrameSocket {
    shared: Arc<Shared>,
    config: SocketConfig,
}

impl FrameSocket {
    /// Create a closed socket.
    pub fn new(config: SocketConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot::Closed),
                generation: AtomicU64::new(0),
            }),
            config,
        }
    }

    /// Open the socket over `transport`.
    ///
    /// Writes the connection header, starts the writer task and returns the
    /// inbound frame stream. Fails with `SocketAlreadyOpen` if open or
    /// already opening. If writing the header fails the socket stays closed;
    /// if `close` is called while the header is still being written the
    /// open is abandoned with `SocketClosed`.
    pub async fn open<T>(&self, transport: T) -> Result<FrameStream<ReadHalf<T>>>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (generation, mut closed_rx) = {
            let mut slot = self.shared.slot.lock().await;
            if !matches!(*slot, Slot::Closed) {
                return Err(SessionError::SocketAlreadyOpen);
            }
            let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
            let (closed_tx, closed_rx) = watch::channel(None);
            *slot = Slot::Opening {
                generation,
                closed_tx,
            };
            (generation, closed_rx)
        };

        let (reader, mut write_half) = tokio::io::split(transport);
        let header = async {
            write_half.write_all(&encode_conn_header()).await?;
            write_half.flush().await
        };
        let written = tokio::select! {
            written = header => written,
            _ = closed_rx.wait_for(Option::is_some) => {
                tracing::debug!("Frame socket open cancelled (generation {})", generation);
                return Err(SessionError::SocketClosed);
            }
        };

        let mut slot = self.shared.slot.lock().await;
        let closed_tx = match std::mem::replace(&mut *slot, Slot::Closed) {
            Slot::Opening {
                generation: current,
                closed_tx,
            } if current == generation => closed_tx,
            other => {
                // closed (and maybe reopened) after the header went out
                *slot = other;
                return Err(SessionError::SocketClosed);
            }
        };
        written?;

        let (writer, writer_task) = spawn_writer_task(write_half, self.config.writer.clone());

        // Write failures are fatal to this connection
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let reason = match writer_task.await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => CloseReason::write_failed(&e),
                Err(e) => CloseReason::Failed {
                    kind: io::ErrorKind::Other,
                    message: format!("writer task failed: {e}"),
                },
            };
            shared.close_generation(generation, reason).await;
        });

        *slot = Slot::Open(OpenConnection {
            writer,
            closed_tx,
            generation,
        });
        tracing::debug!("Frame socket opened (generation {})", generation);

        Ok(FrameStream {
            reader,
            buffer: FrameBuffer::with_max_frame_size(self.config.max_frame_size),
            read_buf: vec![0u8; self.config.read_buffer_size.max(1)],
            closed_rx,
            shared: self.shared.clone(),
            generation,
            finished: false,
        })
    }

    /// Send one frame.
    ///
    /// Fails with `SocketClosed` if not open, or `FrameTooLarge` (before
    /// anything is written) if the payload cannot be length-prefixed.
    pub async fn send_frame(&self, payload: impl Into<Bytes>) -> Result<()> {
        let writer = match &*self.shared.slot.lock().await {
            Slot::Open(open) => open.writer.clone(),
            _ => return Err(SessionError::SocketClosed),
        };

        let frame = OutboundFrame::new(payload.into())?;
        writer.send(frame).await.map_err(|e| match e {
            SessionError::ConnectionClosed => SessionError::SocketClosed,
            other => other,
        })
    }

    /// Close the socket. Safe to call in any state, any number of times,
    /// including while `open` is still writing the header.
    pub async fn close(&self) {
        let mut slot = self.shared.slot.lock().await;
        if let Some(generation) = slot.generation() {
            tracing::debug!("Frame socket closed (generation {})", generation);
            slot.close(CloseReason::Local);
        }
    }

    /// Current socket state. A socket still writing its header is `Closed`.
    pub async fn state(&self) -> SocketState {
        match *self.shared.slot.lock().await {
            Slot::Open(_) => SocketState::Open,
            _ => SocketState::Closed,
        }
    }

    /// Whether the socket is open.
    pub async fn is_open(&self) -> bool {
        self.state().await == SocketState::Open
    }
}

impl Default for FrameSocket {
    fn default() -> Self {
        Self::new(SocketConfig::default())
    }
}

/// Inbound frame sequence of one open connection.
///
/// Frames are read lazily, on demand. The sequence ends with `None` after an
/// explicit `close`, or with one terminal `Err` after a transport or framing
/// failure on either half (which also closes the socket).
pub struct FrameStream<R> {
    reader: R,
    buffer: FrameBuffer,
    read_buf: Vec<u8>,
    closed_rx: watch::Receiver<Option<CloseReason>>,
    shared: Arc<Shared>,
    generation: u64,
    finished: bool,
}

impl<R> FrameStream<R>
where
    R: AsyncRead + Unpin,
{
    /// Wait for the next complete frame.
    pub async fn next(&mut self) -> Option<Result<Frame>> {
        if self.finished {
            return None;
        }

        loop {
            match self.buffer.decode_next() {
                Ok(Some(frame)) => return Some(Ok(frame)),
                Ok(None) => {}
                Err(e) => {
                    self.finish(&format!("framing violation: {e}")).await;
                    return Some(Err(e));
                }
            }

            let closed_rx = &mut self.closed_rx;
            let reader = &mut self.reader;
            let read_buf = &mut self.read_buf;
            let read = tokio::select! {
                biased;
                reason = async {
                    closed_rx
                        .wait_for(Option::is_some)
                        .await
                        .ok()
                        .and_then(|reason| reason.clone())
                } => {
                    self.finished = true;
                    return match reason {
                        Some(CloseReason::Failed { kind, message }) => {
                            Some(Err(SessionError::Io(io::Error::new(kind, message))))
                        }
                        _ => None,
                    };
                }
                read = reader.read(read_buf) => read,
            };

            match read {
                Ok(0) => {
                    self.finish("transport reached EOF").await;
                    return Some(Err(SessionError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "transport closed",
                    ))));
                }
                Ok(n) => self.buffer.extend(&self.read_buf[..n]),
                Err(e) => {
                    self.finish(&format!("read failed: {e}")).await;
                    return Some(Err(SessionError::Io(e)));
                }
            }
        }
    }

    async fn finish(&mut self, reason: &str) {
        self.finished = true;
        let reason = CloseReason::Failed {
            kind: io::ErrorKind::Other,
            message: reason.to_string(),
        };
        self.shared.close_generation(self.generation, reason).await;
    }
}
