//! Frame buffering and the local MJPEG HTTP surface.
//!
//! A [`FrameSource`] is the producer side (camera capture loop, UDP ingest
//! from the encoder, or a muxer passthrough); [`server::MediaServer`] exposes
//! any source as `/?action=snapshot`, `/?action=stream` and `POST /shutdown`.
//! Streaming responses are pulled chunk by chunk through [`MjpegStream`],
//! which runs the blocking source calls on the runtime's blocking pool and
//! cancels them when the connection goes away.

pub mod camera;
pub mod ingest;
pub mod jpeg;
pub mod passthrough;
pub mod queue;
pub mod server;

pub use camera::CameraFrameSource;
pub use ingest::{FrameAssembler, RingFrameSource};
pub use passthrough::PassthroughFrameSource;
pub use queue::{FrameQueue, PopOrder};
pub use server::{MediaServer, MediaServerHandle};

use crate::errors::{Result, StreamError};
use bytes::Bytes;
use futures_util::Stream;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// Granularity of blocking waits that must notice cancellation.
pub(crate) const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Cancellation for one HTTP exchange: set when the client goes away or when
/// the whole server is shutting down.
#[derive(Debug, Clone)]
pub struct CancelToken {
    local: Arc<AtomicBool>,
    server: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::child_of(Arc::new(AtomicBool::new(false)))
    }

    /// Token that is also cancelled when `server` is set.
    pub fn child_of(server: Arc<AtomicBool>) -> Self {
        Self {
            local: Arc::new(AtomicBool::new(false)),
            server,
        }
    }

    pub fn cancel(&self) {
        self.local.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.local.load(Ordering::SeqCst) || self.server.load(Ordering::SeqCst)
    }

    /// Sleep unless cancelled first. Returns `false` on cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(CANCEL_POLL.min(deadline - now));
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer side of the MJPEG endpoints.
///
/// All methods may block; the server calls them off the async executor.
pub trait FrameSource: Send + Sync + 'static {
    /// Per-connection streaming state.
    type Stream: Send + Unpin + 'static;

    /// Multipart boundary token announced in the stream's content type.
    fn boundary(&self) -> &str;

    /// One complete JPEG image.
    fn snapshot(&self, cancel: &CancelToken) -> Result<Bytes>;

    fn open_stream(&self) -> Result<Self::Stream>;

    /// Next bytes of the multipart body; `Ok(None)` ends the response.
    fn next_chunk(&self, stream: &mut Self::Stream, cancel: &CancelToken) -> Result<Option<Bytes>>;
}

type PendingChunk<S> = tokio::task::JoinHandle<(S, Result<Option<Bytes>>)>;

/// Pull-based multipart body. Each poll asks the source for one chunk on the
/// blocking pool; dropping the stream cancels any wait in progress.
pub struct MjpegStream<S: FrameSource> {
    source: Arc<S>,
    state: Option<S::Stream>,
    pending: Option<PendingChunk<S::Stream>>,
    cancel: CancelToken,
}

impl<S: FrameSource> MjpegStream<S> {
    pub fn new(source: Arc<S>, state: S::Stream, cancel: CancelToken) -> Self {
        Self {
            source,
            state: Some(state),
            pending: None,
            cancel,
        }
    }

    fn finish(&mut self) {
        self.state = None;
        self.cancel.cancel();
    }
}

impl<S: FrameSource> Stream for MjpegStream<S> {
    type Item = std::result::Result<Bytes, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.pending.is_none() {
            if this.cancel.is_cancelled() {
                this.finish();
                return Poll::Ready(None);
            }
            let Some(mut state) = this.state.take() else {
                return Poll::Ready(None);
            };
            let source = this.source.clone();
            let cancel = this.cancel.clone();
            this.pending = Some(tokio::task::spawn_blocking(move || {
                let chunk = source.next_chunk(&mut state, &cancel);
                (state, chunk)
            }));
        }

        let Some(pending) = this.pending.as_mut() else {
            return Poll::Ready(None);
        };
        match Pin::new(pending).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(joined) => {
                this.pending = None;
                match joined {
                    Ok((state, Ok(Some(chunk)))) => {
                        this.state = Some(state);
                        Poll::Ready(Some(Ok(chunk)))
                    }
                    Ok((_, Ok(None))) => {
                        this.finish();
                        Poll::Ready(None)
                    }
                    Ok((_, Err(e))) => {
                        log::warn!("MJPEG stream ended: {}", e);
                        this.finish();
                        Poll::Ready(Some(Err(e)))
                    }
                    Err(e) => {
                        this.finish();
                        Poll::Ready(Some(Err(StreamError::Http(format!(
                            "stream worker failed: {}",
                            e
                        )))))
                    }
                }
            }
        }
    }
}

impl<S: FrameSource> Drop for MjpegStream<S> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_follows_server_flag() {
        let server = Arc::new(AtomicBool::new(false));
        let token = CancelToken::child_of(server.clone());
        assert!(!token.is_cancelled());
        server.store(true, Ordering::SeqCst);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_cancel_token_sleep_returns_early() {
        let token = CancelToken::new();
        token.cancel();
        let start = Instant::now();
        assert!(!token.sleep(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_local_cancel_does_not_affect_siblings() {
        let server = Arc::new(AtomicBool::new(false));
        let a = CancelToken::child_of(server.clone());
        let b = CancelToken::child_of(server);
        a.cancel();
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
    }
}
