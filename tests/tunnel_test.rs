//! Gateway tunnel against a local WebSocket server.

use futures_util::{SinkExt, StreamExt};
use picam_streamer::testing::test_context;
use picam_streamer::tunnel::TunnelRelay;
use picam_streamer::Backoff;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

const PROTOCOL: &str = "janus-protocol";

struct FakeGateway {
    port: u16,
    received: crossbeam_channel::Receiver<String>,
    protocols: crossbeam_channel::Receiver<String>,
}

/// Accept `connections` clients in turn. Each is greeted with `welcome <n>`,
/// the first message it sends is recorded, then the server closes it.
fn spawn_gateway(connections: usize) -> FakeGateway {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let port = listener.local_addr().unwrap().port();
    let (received_tx, received) = crossbeam_channel::unbounded();
    let (protocol_tx, protocols) = crossbeam_channel::unbounded();

    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            for n in 0..connections {
                let (stream, _) = listener.accept().await.unwrap();
                let protocol_tx = protocol_tx.clone();
                let echo = move |req: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
                    if let Some(protocol) = req.headers().get("Sec-WebSocket-Protocol") {
                        protocol_tx
                            .send(protocol.to_str().unwrap_or_default().to_string())
                            .ok();
                        response
                            .headers_mut()
                            .insert("Sec-WebSocket-Protocol", protocol.clone());
                    }
                    Ok(response)
                };
                let mut ws = tokio_tungstenite::accept_hdr_async(stream, echo).await.unwrap();
                ws.send(Message::Text(format!("welcome {}", n).into())).await.unwrap();

                if let Ok(Some(Ok(Message::Text(text)))) =
                    tokio::time::timeout(Duration::from_secs(5), ws.next()).await
                {
                    received_tx.send(text.as_str().to_string()).ok();
                }
                let _ = ws.close(None).await;
            }
        });
    });

    FakeGateway {
        port,
        received,
        protocols,
    }
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}

fn relay(port: u16, upstream: crossbeam_channel::Sender<String>) -> TunnelRelay {
    let (ctx, _alerts, _reporter) = test_context();
    TunnelRelay::new(
        format!("ws://127.0.0.1:{}/", port),
        PROTOCOL,
        Backoff::new(Duration::from_millis(10), Duration::from_millis(100)),
        ctx,
        Arc::new(upstream),
    )
}

#[test]
fn test_relay_forwards_both_directions() {
    let gateway = spawn_gateway(1);
    let (upstream_tx, upstream) = crossbeam_channel::unbounded();
    let relay = relay(gateway.port, upstream_tx);
    let thread = relay.start().unwrap();

    let first = upstream.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(first, r#"{"janus":"welcome 0"}"#);
    assert_eq!(
        gateway.protocols.recv_timeout(Duration::from_secs(1)).unwrap(),
        PROTOCOL
    );

    assert!(relay.is_connected());
    assert!(relay.send(r#"{"janus":"keepalive"}"#));
    assert_eq!(
        gateway.received.recv_timeout(Duration::from_secs(5)).unwrap(),
        r#"{"janus":"keepalive"}"#
    );

    relay.stop();
    assert!(wait_until(Duration::from_secs(5), || thread.is_finished()));
}

#[test]
fn test_relay_reconnects_after_close() {
    let gateway = spawn_gateway(2);
    let (upstream_tx, upstream) = crossbeam_channel::unbounded();
    let relay = relay(gateway.port, upstream_tx);
    let thread = relay.start().unwrap();

    assert_eq!(
        upstream.recv_timeout(Duration::from_secs(5)).unwrap(),
        r#"{"janus":"welcome 0"}"#
    );
    assert!(relay.send("bye"));
    assert_eq!(gateway.received.recv_timeout(Duration::from_secs(5)).unwrap(), "bye");

    // The gateway closes the first connection; the relay dials again.
    assert_eq!(
        upstream.recv_timeout(Duration::from_secs(5)).unwrap(),
        r#"{"janus":"welcome 1"}"#
    );

    relay.stop();
    assert!(wait_until(Duration::from_secs(5), || thread.is_finished()));
    assert!(!relay.is_connected());
}

#[test]
fn test_relay_keeps_retrying_while_gateway_is_down() {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    let (upstream_tx, upstream) = crossbeam_channel::unbounded();
    let relay = relay(port, upstream_tx);
    let thread = relay.start().unwrap();

    std::thread::sleep(Duration::from_millis(200));
    assert!(!relay.is_connected());
    assert!(!relay.send("dropped"));
    assert!(upstream.try_recv().is_err());
    assert!(!thread.is_finished());

    relay.stop();
    assert!(wait_until(Duration::from_secs(5), || thread.is_finished()));
}
