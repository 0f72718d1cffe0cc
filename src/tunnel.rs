//! WebSocket relay between the local WebRTC gateway and an upstream channel.
//!
//! Gateway messages are forwarded upstream wrapped as `{"janus": <text>}`.
//! Messages sent through [`TunnelRelay::send`] go to the gateway if a
//! connection is up and are dropped otherwise. When the connection closes
//! the relay reconnects after an exponential delay, which is reset by every
//! message received.

use crate::backoff::Backoff;
use crate::context::RunContext;
use crate::errors::{Result, StreamError};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

/// Receives gateway traffic bound for the remote peer.
pub trait UpstreamSink: Send + Sync {
    fn send_text(&self, text: String);
}

impl UpstreamSink for crossbeam_channel::Sender<String> {
    fn send_text(&self, text: String) {
        if self.send(text).is_err() {
            log::debug!("Upstream channel closed; dropping gateway message");
        }
    }
}

/// Upstream that only logs, for hosts without a remote peer channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogUpstream;

impl UpstreamSink for LogUpstream {
    fn send_text(&self, text: String) {
        log::debug!("gateway -> upstream: {}", text);
    }
}

/// Wrap one gateway message for the upstream channel.
pub fn upstream_envelope(message: &str) -> String {
    serde_json::json!({ "janus": message }).to_string()
}

type Keepalive = Box<dyn Fn() -> bool + Send + Sync>;

struct TunnelInner {
    url: String,
    subprotocol: String,
    ctx: RunContext,
    upstream: Arc<dyn UpstreamSink>,
    backoff: Mutex<Backoff>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<String>>>,
    stop: Notify,
    stopped: AtomicBool,
    keepalive: Option<Keepalive>,
}

impl TunnelInner {
    fn should_stop(&self) -> bool {
        if self.stopped.load(Ordering::SeqCst) || self.ctx.is_shutting_down() {
            return true;
        }
        self.keepalive.as_ref().is_some_and(|alive| !alive())
    }

    fn on_message(&self, text: &str) {
        self.upstream.send_text(upstream_envelope(text));
        self.backoff.lock().expect("lock poisoned").reset();
    }
}

/// Persistent gateway connection, driven by its own thread.
#[derive(Clone)]
pub struct TunnelRelay {
    inner: Arc<TunnelInner>,
}

impl TunnelRelay {
    pub fn new(
        url: impl Into<String>,
        subprotocol: impl Into<String>,
        backoff: Backoff,
        ctx: RunContext,
        upstream: Arc<dyn UpstreamSink>,
    ) -> Self {
        Self {
            inner: Arc::new(TunnelInner {
                url: url.into(),
                subprotocol: subprotocol.into(),
                ctx,
                upstream,
                backoff: Mutex::new(backoff),
                outgoing: Mutex::new(None),
                stop: Notify::new(),
                stopped: AtomicBool::new(false),
                keepalive: None,
            }),
        }
    }

    /// Also stop reconnecting once `alive` returns false, e.g. when the
    /// process the tunnel depends on is no longer supposed to run.
    pub fn with_keepalive<F>(mut self, alive: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.keepalive = Some(Box::new(alive)),
            None => log::warn!("Tunnel keepalive ignored: relay already shared"),
        }
        self
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn start(&self) -> Result<JoinHandle<()>> {
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name("gateway-tunnel".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        log::error!("Failed to build tunnel runtime: {}", e);
                        return;
                    }
                };
                runtime.block_on(run(inner));
            })?;
        Ok(handle)
    }

    /// Forward `message` to the gateway. Returns `false` if it was dropped
    /// because no connection is up.
    pub fn send(&self, message: &str) -> bool {
        let outgoing = self.inner.outgoing.lock().expect("lock poisoned");
        match outgoing.as_ref() {
            Some(tx) => tx.send(message.to_string()).is_ok(),
            None => {
                log::debug!("Gateway tunnel not connected; dropping message");
                false
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.outgoing.lock().expect("lock poisoned").is_some()
    }

    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.stop.notify_one();
    }
}

async fn run(inner: Arc<TunnelInner>) {
    loop {
        if inner.should_stop() {
            break;
        }

        match connect(&inner).await {
            Ok(ws) => {
                log::info!("Gateway tunnel connected to {}", inner.url);
                let (tx, rx) = mpsc::unbounded_channel();
                *inner.outgoing.lock().expect("lock poisoned") = Some(tx);
                session(&inner, ws, rx).await;
                *inner.outgoing.lock().expect("lock poisoned") = None;
            }
            Err(e) => log::debug!("Gateway tunnel connect failed: {}", e),
        }

        if inner.should_stop() {
            break;
        }
        let delay = inner.backoff.lock().expect("lock poisoned").more();
        log::warn!("Gateway tunnel closed. Reconnecting in {:?}", delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = inner.stop.notified() => break,
        }
    }
    log::debug!("Gateway tunnel stopped");
}

type GatewaySocket = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect(inner: &TunnelInner) -> Result<GatewaySocket> {
    let mut request = inner
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| StreamError::Tunnel(e.to_string()))?;
    if !inner.subprotocol.is_empty() {
        let value =
            HeaderValue::from_str(&inner.subprotocol).map_err(|e| StreamError::Tunnel(e.to_string()))?;
        request.headers_mut().insert("Sec-WebSocket-Protocol", value);
    }
    let (ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| StreamError::Tunnel(e.to_string()))?;
    Ok(ws)
}

async fn session(inner: &TunnelInner, ws: GatewaySocket, mut outgoing: mpsc::UnboundedReceiver<String>) {
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => inner.on_message(text.as_str()),
                Some(Ok(Message::Binary(data))) => inner.on_message(&String::from_utf8_lossy(&data)),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("Gateway tunnel error: {}", e);
                    break;
                }
            },
            message = outgoing.recv() => match message {
                Some(text) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        log::warn!("Gateway tunnel send failed: {}", e);
                        break;
                    }
                }
                None => break,
            },
            _ = inner.stop.notified() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
}
