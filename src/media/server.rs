//! Local HTTP endpoint serving snapshots and the multipart stream.
//!
//! Routes:
//! - `GET /?action=snapshot` one JPEG (`image/jpeg`), 500 when no frame
//! - `GET /?action=stream` `multipart/x-mixed-replace` until the client leaves
//! - `POST /shutdown` stops the server and releases the port
//!
//! The server runs on its own thread with its own runtime so the rest of the
//! supervisor stays synchronous.

use crate::errors::{Result, StreamError};
use crate::media::{CancelToken, FrameSource, MjpegStream};
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

const RUNTIME_SHUTDOWN: Duration = Duration::from_secs(1);

struct ServerState<S> {
    source: Arc<S>,
    closing: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl<S> Clone for ServerState<S> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            closing: self.closing.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<S> ServerState<S> {
    fn request_shutdown(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }
}

pub struct MediaServer;

impl MediaServer {
    /// Bind `host:port` and serve `source` on a background thread.
    ///
    /// Binding happens before this returns, so an occupied port is reported
    /// here rather than from the server thread.
    pub fn start<S: FrameSource>(host: &str, port: u16, source: Arc<S>) -> Result<MediaServerHandle> {
        let listener = TcpListener::bind((host, port))?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let closing = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(Notify::new());
        let state = ServerState {
            source,
            closing: closing.clone(),
            shutdown: shutdown.clone(),
        };

        let thread = std::thread::Builder::new()
            .name("media-server".to_string())
            .spawn(move || serve(listener, state))?;

        log::info!("Serving MJPEG on http://{}", addr);
        Ok(MediaServerHandle {
            addr,
            closing,
            shutdown,
            thread: Mutex::new(Some(thread)),
        })
    }
}

fn serve<S: FrameSource>(listener: TcpListener, state: ServerState<S>) {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("media-server-worker")
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to build media server runtime: {}", e);
            return;
        }
    };

    let shutdown = state.shutdown.clone();
    let outcome: std::io::Result<()> = runtime.block_on(async move {
        let listener = tokio::net::TcpListener::from_std(listener)?;
        let app = Router::new()
            .route("/", get(webcam::<S>))
            .route("/shutdown", post(shutdown_route::<S>))
            .with_state(state);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.notified().await })
            .await
    });
    if let Err(e) = outcome {
        log::error!("Media server stopped with error: {}", e);
    }
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN);
    log::debug!("Media server stopped");
}

async fn webcam<S: FrameSource>(
    State(state): State<ServerState<S>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let cancel = CancelToken::child_of(state.closing.clone());
    match params.get("action").map(String::as_str) {
        Some("snapshot") => snapshot(state.source, cancel).await,
        Some(_) => stream(state.source, cancel).await,
        None => (StatusCode::BAD_REQUEST, "missing action").into_response(),
    }
}

async fn snapshot<S: FrameSource>(source: Arc<S>, cancel: CancelToken) -> Response {
    let guard = cancel.clone();
    let result = tokio::task::spawn_blocking(move || source.snapshot(&cancel)).await;
    guard.cancel();
    match result {
        Ok(Ok(jpeg)) => ([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response(),
        Ok(Err(e)) => {
            log::warn!("Snapshot failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn stream<S: FrameSource>(source: Arc<S>, cancel: CancelToken) -> Response {
    let opener = source.clone();
    let opened = tokio::task::spawn_blocking(move || opener.open_stream())
        .await
        .map_err(|e| StreamError::Http(e.to_string()))
        .and_then(|r| r);
    let state = match opened {
        Ok(state) => state,
        Err(e) => {
            log::warn!("Stream open failed: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    let content_type = format!("multipart/x-mixed-replace;boundary={}", source.boundary());
    let body = Body::from_stream(MjpegStream::new(source, state, cancel));
    (
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        body,
    )
        .into_response()
}

async fn shutdown_route<S: FrameSource>(State(state): State<ServerState<S>>) -> &'static str {
    log::info!("Media server shutdown requested");
    state.request_shutdown();
    "Ok"
}

/// Running server; shutting down is idempotent.
pub struct MediaServerHandle {
    addr: SocketAddr,
    closing: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl MediaServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Stop accepting, end open streams and release the port.
    pub fn shutdown(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    /// Wait up to `timeout` for the server thread. Returns whether it ended.
    pub fn join(&self, timeout: Duration) -> bool {
        let mut slot = self.thread.lock().expect("lock poisoned");
        let Some(handle) = slot.take() else {
            return true;
        };
        let start = Instant::now();
        while !handle.is_finished() && start.elapsed() < timeout {
            std::thread::sleep(Duration::from_millis(10));
        }
        if handle.is_finished() {
            let _ = handle.join();
            true
        } else {
            *slot = Some(handle);
            false
        }
    }
}

impl std::fmt::Debug for MediaServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaServerHandle")
            .field("addr", &self.addr)
            .field("closing", &self.is_closing())
            .finish()
    }
}
