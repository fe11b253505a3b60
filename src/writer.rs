//! Single-writer task for outbound frames.
//!
//! A socket's write half is owned by exactly one task. Callers queue
//! length-prefixed frames over an mpsc channel, so the bytes of two frames
//! can never interleave on the wire no matter how many tasks send at once.
//!
//! # Architecture
//!
//! ```text
//! send_frame ─┐
//! send_frame ─┼─► mpsc::Sender<OutboundFrame> ─► writer_loop ─► WriteHalf
//! send_frame ─┘          (queued count)            (vectored batches)
//! ```
//!
//! Frames already waiting in the channel are coalesced into one vectored
//! write. The queued count gives backpressure: once `max_queued_frames` are
//! outstanding, senders park until the writer drains a batch or the
//! configured timeout elapses.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::error::{Result, SessionError};
use crate::protocol::{encode_length, FRAME_LENGTH_SIZE};

/// Default number of queued frames before senders are parked.
pub const DEFAULT_MAX_QUEUED_FRAMES: usize = 1024;

/// Default mpsc queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default time a sender may stay parked behind a full queue.
pub const DEFAULT_QUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on frames coalesced into one write.
const MAX_BATCH_FRAMES: usize = 64;

/// Upper bound on bytes coalesced into one write (256KB).
const MAX_BATCH_BYTES: usize = 256 * 1024;

/// A payload with its length prefix already encoded.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Big-endian 3-byte length prefix.
    pub prefix: [u8; FRAME_LENGTH_SIZE],
    /// Payload bytes.
    pub payload: Bytes,
}

impl OutboundFrame {
    /// Prefix `payload`. Fails with `FrameTooLarge` if its length does not
    /// fit the prefix, so nothing oversized ever reaches the queue.
    pub fn new(payload: Bytes) -> Result<Self> {
        let prefix = encode_length(payload.len())?;
        Ok(Self { prefix, payload })
    }

    /// Bytes this frame occupies on the wire.
    #[inline]
    pub fn wire_size(&self) -> usize {
        self.prefix.len() + self.payload.len()
    }
}

/// Settings for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Queued frames at which senders start waiting.
    pub max_queued_frames: usize,
    /// Capacity of the mpsc queue.
    pub queue_capacity: usize,
    /// How long a sender waits for the queue to drain.
    pub queue_timeout: Duration,
}

impl WriterConfig {
    /// Set the backpressure threshold.
    pub fn max_queued_frames(mut self, frames: usize) -> Self {
        self.max_queued_frames = frames;
        self
    }

    /// Set how long senders wait behind a full queue.
    pub fn queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_queued_frames: DEFAULT_MAX_QUEUED_FRAMES,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            queue_timeout: DEFAULT_QUEUE_TIMEOUT,
        }
    }
}

/// Accounting shared between senders and the writer task.
#[derive(Debug, Default)]
struct Queue {
    queued: AtomicUsize,
    drained: Notify,
}

impl Queue {
    fn release(&self, frames: usize) {
        self.queued.fetch_sub(frames, Ordering::AcqRel);
        self.drained.notify_waiters();
    }
}

/// Sending side of the writer task.
///
/// Clones share one queue. Once every handle is gone the writer shuts the
/// transport down.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    queue: Arc<Queue>,
    max_queued: usize,
    timeout: Duration,
}

impl WriterHandle {
    /// Queue one frame.
    ///
    /// Parks while the queue is at its threshold; fails with
    /// `BackpressureTimeout` if it stays full for the configured timeout and
    /// with `ConnectionClosed` if the writer task has stopped.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        if self.is_backpressure_active() {
            tokio::time::timeout(self.timeout, self.wait_for_room())
                .await
                .map_err(|_| SessionError::BackpressureTimeout)?;
        }

        self.queue.queued.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(frame).await.is_err() {
            self.queue.release(1);
            return Err(SessionError::ConnectionClosed);
        }
        Ok(())
    }

    async fn wait_for_room(&self) {
        loop {
            let drained = self.queue.drained.notified();
            if !self.is_backpressure_active() || self.tx.is_closed() {
                return;
            }
            drained.await;
        }
    }

    /// Whether senders are currently being parked.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.queued_count() >= self.max_queued
    }

    /// Frames queued but not yet written.
    #[inline]
    pub fn queued_count(&self) -> usize {
        self.queue.queued.load(Ordering::Acquire)
    }

    /// Whether the writer task has stopped accepting frames.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Start the writer task over `writer`.
///
/// The returned `JoinHandle` yields `Ok` after a clean shutdown (every
/// handle dropped) and `Err` on the first failed write.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let queue = Arc::new(Queue::default());

    let handle = WriterHandle {
        tx,
        queue: queue.clone(),
        max_queued: config.max_queued_frames,
        timeout: config.queue_timeout,
    };
    let task = tokio::spawn(writer_loop(rx, writer, queue));

    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    queue: Arc<Queue>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_FRAMES);

    while let Some(first) = rx.recv().await {
        let mut batch_bytes = first.wire_size();
        batch.push(first);

        while batch.len() < MAX_BATCH_FRAMES && batch_bytes < MAX_BATCH_BYTES {
            let Ok(frame) = rx.try_recv() else { break };
            batch_bytes += frame.wire_size();
            batch.push(frame);
        }

        let written = write_batch(&mut writer, &batch, batch_bytes).await;
        queue.release(batch.len());
        batch.clear();
        if let Err(e) = written {
            tracing::error!("Frame write failed: {}", e);
            return Err(e);
        }
    }

    writer.shutdown().await?;
    Ok(())
}

/// Write every frame of `batch` with as few vectored writes as the
/// transport allows, then flush.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame], total: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut done = 0;
    while done < total {
        let slices = unwritten_slices(batch, done);
        match writer.write_vectored(&slices).await? {
            0 => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "transport accepted no bytes",
                )
                .into())
            }
            n => done += n,
        }
    }

    writer.flush().await?;
    Ok(())
}

/// Slices covering everything in `batch` after the first `written` bytes.
fn unwritten_slices(batch: &[OutboundFrame], written: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut position = 0;

    let parts = batch
        .iter()
        .flat_map(|frame| [&frame.prefix[..], &frame.payload[..]]);
    for part in parts {
        let end = position + part.len();
        if written < end && !part.is_empty() {
            slices.push(IoSlice::new(&part[written.saturating_sub(position)..]));
        }
        position = end;
    }

    slices
}
