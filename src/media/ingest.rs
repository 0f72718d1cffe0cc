//! MJPEG side stream pushed by the encoder over local UDP.
//!
//! The encoder writes `mpjpeg` output with boundary `ffmpeg`. Datagrams are
//! accumulated until the buffer ends with the boundary line; each such entry
//! holds one part's headers and image, followed by the next boundary.

use crate::context::RunContext;
use crate::errors::{Result, StreamError};
use crate::media::jpeg::extract_jpeg;
use crate::media::queue::{FrameQueue, PopOrder};
use crate::media::{CancelToken, FrameSource, CANCEL_POLL};
use bytes::{Bytes, BytesMut};
use std::net::UdpSocket;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub const FFMPEG_BOUNDARY: &str = "ffmpeg";

const BOUNDARY_LINE: &[u8] = b"--ffmpeg\r\n";
const DATAGRAM_SIZE: usize = 4 * 1024;
const RECV_TIMEOUT: Duration = Duration::from_millis(500);
const SNAPSHOT_POLLS: u32 = 100;
const SNAPSHOT_POLL: Duration = Duration::from_millis(10);

/// Reassembles multipart entries from arbitrary datagram boundaries.
#[derive(Debug)]
pub struct FrameAssembler {
    buf: BytesMut,
    max_bytes: usize,
}

impl FrameAssembler {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(64 * 1024),
            max_bytes,
        }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append one datagram. Returns a complete entry when the buffer now
    /// ends with the boundary line.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<Bytes>> {
        self.buf.extend_from_slice(chunk);
        if self.buf.len() > self.max_bytes {
            self.buf.clear();
            return Err(StreamError::ProtocolViolation(
                "Proper multi-part boundary not detected in MJPEG stream".to_string(),
            ));
        }
        if self.buf.ends_with(BOUNDARY_LINE) {
            return Ok(Some(self.buf.split().freeze()));
        }
        Ok(None)
    }
}

/// Ring of recent multipart entries. Readers take the most recent entry and
/// discard the backlog behind it, so a stream never moves back in time.
pub struct RingFrameSource {
    ring: FrameQueue<Bytes>,
    max_bytes: usize,
}

/// Streaming state: whether the opening boundary line was sent.
#[derive(Debug, Default)]
pub struct RingStream {
    opened: bool,
}

impl RingFrameSource {
    pub fn new(capacity: usize, max_bytes: usize) -> Self {
        Self {
            ring: FrameQueue::new(capacity),
            max_bytes,
        }
    }

    pub fn ring(&self) -> &FrameQueue<Bytes> {
        &self.ring
    }

    /// Read datagrams from `socket` into the ring until shutdown or a
    /// framing error. The socket must have a read timeout set.
    pub fn ingest(&self, socket: &UdpSocket, ctx: &RunContext) -> Result<()> {
        let mut assembler = FrameAssembler::new(self.max_bytes);
        let mut datagram = vec![0u8; DATAGRAM_SIZE];
        while !ctx.is_shutting_down() {
            let n = match socket.recv(&mut datagram) {
                Ok(n) => n,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue
                }
                Err(e) => return Err(e.into()),
            };
            if let Some(entry) = assembler.push(&datagram[..n])? {
                self.ring.push_drop_oldest(entry);
            }
        }
        Ok(())
    }

    /// Bind the ingest port and read it on a dedicated thread. `on_fatal`
    /// runs once if ingestion fails while the run is still live.
    pub fn start_ingest<F>(self: &Arc<Self>, port: u16, ctx: RunContext, on_fatal: F) -> Result<JoinHandle<()>>
    where
        F: FnOnce(StreamError) + Send + 'static,
    {
        let socket = UdpSocket::bind(("127.0.0.1", port))?;
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;
        log::info!("Receiving encoder MJPEG on udp://127.0.0.1:{}", port);

        let source = self.clone();
        let handle = std::thread::Builder::new()
            .name("mjpeg-ingest".to_string())
            .spawn(move || {
                let outcome = source.ingest(&socket, &ctx);
                source.ring.close();
                if let Err(e) = outcome {
                    if !ctx.is_shutting_down() {
                        log::error!("MJPEG ingest failed: {}", e);
                        on_fatal(e);
                    }
                }
            })?;
        Ok(handle)
    }
}

impl FrameSource for RingFrameSource {
    type Stream = RingStream;

    fn boundary(&self) -> &str {
        FFMPEG_BOUNDARY
    }

    fn snapshot(&self, cancel: &CancelToken) -> Result<Bytes> {
        for _ in 0..SNAPSHOT_POLLS {
            if cancel.is_cancelled() {
                break;
            }
            if let Some(entry) = self.ring.pop_timeout(PopOrder::Latest, SNAPSHOT_POLL)? {
                return extract_jpeg(&entry);
            }
        }
        Err(StreamError::StaleDataTimeout(
            "no MJPEG frame received from encoder".to_string(),
        ))
    }

    fn open_stream(&self) -> Result<RingStream> {
        Ok(RingStream::default())
    }

    fn next_chunk(&self, stream: &mut RingStream, cancel: &CancelToken) -> Result<Option<Bytes>> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let entry = match self.ring.pop_timeout(PopOrder::Latest, CANCEL_POLL) {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(_) => return Ok(None),
            };
            if stream.opened {
                return Ok(Some(entry));
            }
            // Entries end with the boundary of the part after them, so the
            // first one written needs its own opening boundary.
            stream.opened = true;
            let mut first = BytesMut::with_capacity(BOUNDARY_LINE.len() + entry.len());
            first.extend_from_slice(BOUNDARY_LINE);
            first.extend_from_slice(&entry);
            return Ok(Some(first.freeze()));
        }
    }
}
