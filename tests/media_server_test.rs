//! HTTP surface tests for the local MJPEG server
//!
//! Each test binds its own server on an ephemeral port and talks to it with
//! a blocking client.

use bytes::Bytes;
use picam_streamer::config::ServerConfig;
use picam_streamer::media::jpeg::{EOI, SOI};
use picam_streamer::media::{CameraFrameSource, MediaServer, RingFrameSource};
use picam_streamer::net;
use picam_streamer::testing::{synthetic_frame, synthetic_jpeg, test_context};
use picam_streamer::Backoff;
use std::io::Read;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn server_config() -> ServerConfig {
    ServerConfig {
        stream_interval_ms: 20,
        frame_timeout_ms: 500,
        stale_threshold_ms: 1,
        ..ServerConfig::default()
    }
}

fn client() -> reqwest::blocking::Client {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

/// Publish a new synthetic frame every few milliseconds until `stop` is set.
fn feed(source: Arc<CameraFrameSource>, stop: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut n = 0;
        while !stop.load(Ordering::SeqCst) {
            source.publish(Bytes::from(synthetic_frame(n, 64, 48)));
            n += 1;
            std::thread::sleep(Duration::from_millis(5));
        }
    })
}

#[test]
fn test_snapshot_serves_a_jpeg() {
    let source = Arc::new(CameraFrameSource::new(&server_config()));
    let stop = Arc::new(AtomicBool::new(false));
    let feeder = feed(source.clone(), stop.clone());

    let server = MediaServer::start("127.0.0.1", 0, source).unwrap();
    let url = format!("http://{}/?action=snapshot", server.local_addr());
    let response = client().get(&url).send().unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "image/jpeg");
    let body = response.bytes().unwrap();
    assert!(body.starts_with(&SOI));
    assert!(body.ends_with(&EOI));

    stop.store(true, Ordering::SeqCst);
    feeder.join().unwrap();
    server.shutdown();
    assert!(server.join(Duration::from_secs(3)));
}

#[test]
fn test_snapshot_without_frames_is_server_error() {
    let config = ServerConfig {
        frame_timeout_ms: 100,
        ..server_config()
    };
    let server = MediaServer::start("127.0.0.1", 0, Arc::new(CameraFrameSource::new(&config))).unwrap();
    let url = format!("http://{}/?action=snapshot", server.local_addr());
    let response = client().get(&url).send().unwrap();
    assert_eq!(response.status(), 500);
    server.shutdown();
}

#[test]
fn test_missing_action_is_bad_request() {
    let server = MediaServer::start(
        "127.0.0.1",
        0,
        Arc::new(CameraFrameSource::new(&server_config())),
    )
    .unwrap();
    let response = client()
        .get(format!("http://{}/", server.local_addr()))
        .send()
        .unwrap();
    assert_eq!(response.status(), 400);
    server.shutdown();
}

#[test]
fn test_stream_sends_multipart_parts() {
    let source = Arc::new(CameraFrameSource::new(&server_config()));
    let stop = Arc::new(AtomicBool::new(false));
    let feeder = feed(source.clone(), stop.clone());

    let server = MediaServer::start("127.0.0.1", 0, source).unwrap();
    let url = format!("http://{}/?action=stream", server.local_addr());
    let mut response = client().get(&url).send().unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"],
        "multipart/x-mixed-replace;boundary=herebedragons"
    );
    assert_eq!(response.headers()["cache-control"], "no-cache");

    let mut received = Vec::new();
    let mut buf = [0u8; 8192];
    while received.windows(15).filter(|w| w == b"--herebedragons").count() < 2 {
        let n = response.read(&mut buf).unwrap();
        assert!(n > 0, "stream ended early");
        received.extend_from_slice(&buf[..n]);
    }
    assert!(received.starts_with(b"--herebedragons\r\nContent-Type: image/jpeg\r\n"));
    drop(response);

    stop.store(true, Ordering::SeqCst);
    feeder.join().unwrap();
    server.shutdown();
    assert!(server.join(Duration::from_secs(3)));
}

#[test]
fn test_shutdown_route_releases_port() {
    let server = MediaServer::start(
        "127.0.0.1",
        0,
        Arc::new(CameraFrameSource::new(&server_config())),
    )
    .unwrap();
    let addr = server.local_addr();
    assert!(net::port_open("127.0.0.1", addr.port()));

    net::post_shutdown(&format!("http://{}", addr)).unwrap();
    assert!(server.join(Duration::from_secs(3)));
    assert!(server.is_closing());
    let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(100));
    net::wait_for_port_to_close("127.0.0.1", addr.port(), &mut backoff, 20).unwrap();
}

#[test]
fn test_ring_source_serves_ingested_frames() {
    let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
    let ingest_port = probe.local_addr().unwrap().port();
    drop(probe);

    let (ctx, _alerts, _reporter) = test_context();
    let source = Arc::new(RingFrameSource::new(4, 1024 * 1024));
    let ingest = source
        .start_ingest(ingest_port, ctx.clone(), |e| panic!("ingest failed: {}", e))
        .unwrap();
    let server = MediaServer::start("127.0.0.1", 0, source).unwrap();

    let jpeg = synthetic_jpeg(64, 48);
    let mut entry = b"Content-type: image/jpeg\r\n\r\n".to_vec();
    entry.extend_from_slice(&jpeg);
    entry.extend_from_slice(b"\r\n--ffmpeg\r\n");
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    for chunk in entry.chunks(1024) {
        sender.send_to(chunk, ("127.0.0.1", ingest_port)).unwrap();
    }

    let url = format!("http://{}/?action=snapshot", server.local_addr());
    let body = client().get(&url).send().unwrap().bytes().unwrap();
    assert_eq!(&body[..], &jpeg[..]);

    ctx.begin_shutdown();
    server.shutdown();
    ingest.join().unwrap();
}
