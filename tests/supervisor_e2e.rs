//! End-to-end pipeline runs against fake hardware and a stand-in encoder.
//!
//! The encoder binary is a shell script that swallows its standard input, so
//! the supervisor can start, watch and kill it like the real thing.
#![cfg(unix)]

use bytes::Bytes;
use picam_streamer::alerts::cause;
use picam_streamer::config::{CompatibleMode, ServerConfig, SubscriptionTier};
use picam_streamer::media::jpeg::{EOI, SOI};
use picam_streamer::media::{CameraFrameSource, MediaServer, MediaServerHandle};
use picam_streamer::net;
use picam_streamer::process::{bitrate_for_dim, ProcessRole};
use picam_streamer::testing::{
    synthetic_jpeg, FakeCamera, FakeHardware, FakeLegacyDaemon, RecordingAlertSink,
    RecordingCrashReporter,
};
use picam_streamer::tunnel::LogUpstream;
use picam_streamer::{Collaborators, PipelineMode, StreamSupervisor, StreamerConfig};
use std::net::{TcpListener, UdpSocket};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Harness {
    supervisor: StreamSupervisor,
    legacy: Arc<FakeLegacyDaemon>,
    alerts: Arc<RecordingAlertSink>,
    reporter: Arc<RecordingCrashReporter>,
    _dir: TempDir,
}

fn free_tcp_port() -> u16 {
    TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

fn free_udp_port() -> u16 {
    UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

fn write_encoder(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("fake-encoder");
    std::fs::write(&path, "#!/bin/sh\nexec cat > /dev/null\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn config(dir: &Path) -> StreamerConfig {
    let mut config = StreamerConfig::default();
    config.streaming.exclusive_use_marker = dir.join("exclusive");
    config.server.port = free_tcp_port();
    config.server.frame_timeout_ms = 2000;
    config.encoder.binary = write_encoder(dir);
    config.encoder.niceness = None;
    config.camera.init_attempts = 2;
    config.usb.ingest_port = free_udp_port();
    config.gateway.tunnel_enabled = false;
    config.legacy.first_frame_attempts = 3;
    config.supervision.backoff_min_ms = 10;
    config.supervision.restart_backoff_max_secs = 1;
    config.supervision.tunnel_backoff_max_secs = 1;
    config
}

fn harness(
    edit: impl FnOnce(&mut StreamerConfig),
    hardware: FakeHardware,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    edit(&mut config);

    let legacy = Arc::new(FakeLegacyDaemon::default());
    let alerts = Arc::new(RecordingAlertSink::default());
    let reporter = Arc::new(RecordingCrashReporter::default());
    let supervisor = StreamSupervisor::new(
        config,
        Collaborators {
            hardware: Arc::new(hardware),
            legacy: legacy.clone(),
            alerts: alerts.clone(),
            reporter: reporter.clone(),
            upstream: Arc::new(LogUpstream),
        },
    );
    Harness {
        supervisor,
        legacy,
        alerts,
        reporter,
        _dir: dir,
    }
}

/// A stand-in for the legacy daemon's HTTP endpoint, serving `w`x`h` frames.
struct LegacyEndpoint {
    server: MediaServerHandle,
    stop: Arc<AtomicBool>,
}

impl LegacyEndpoint {
    fn start(width: u32, height: u32) -> Self {
        let source = Arc::new(CameraFrameSource::new(&ServerConfig {
            stale_threshold_ms: 1,
            ..ServerConfig::default()
        }));
        let stop = Arc::new(AtomicBool::new(false));
        {
            let source = source.clone();
            let stop = stop.clone();
            let jpeg = Bytes::from(synthetic_jpeg(width, height));
            std::thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    source.publish(jpeg.clone());
                    std::thread::sleep(Duration::from_millis(10));
                }
            });
        }
        let server = MediaServer::start("127.0.0.1", 0, source).unwrap();
        Self { server, stop }
    }

    fn url(&self, action: &str) -> String {
        format!("http://{}/?action={}", self.server.local_addr(), action)
    }
}

impl Drop for LegacyEndpoint {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.server.shutdown();
    }
}

fn encoder_command(supervisor: &StreamSupervisor) -> picam_streamer::process::CommandLine {
    supervisor
        .process_commands()
        .into_iter()
        .find(|(role, _)| *role == ProcessRole::Encoder)
        .map(|(_, command)| command)
        .unwrap()
}

#[test]
fn test_native_pipeline_serves_camera_and_restores() {
    let camera = Arc::new(FakeCamera::new(64, 48, Duration::from_millis(10)));
    let hardware = FakeHardware::new(true, Some(camera.clone()), false);
    hardware.open_failures.store(1, Ordering::SeqCst);
    let opened_with = hardware.opened_with.clone();
    let h = harness(|_| {}, hardware);

    h.supervisor.run();
    assert_eq!(h.supervisor.mode(), Some(PipelineMode::NativeCodecGateway));
    assert_eq!(h.legacy.stops(), 1);
    assert!(camera.is_recording());

    let command = encoder_command(&h.supervisor).to_string();
    assert!(command.contains("-i pipe:0"), "{}", command);
    assert!(command.contains("-c:v copy"), "{}", command);

    // The camera module does the H.264 encoding, so it carries the bitrate.
    let config = h.supervisor.config();
    let (width, height) = config.camera.resolution.resolution(config.camera.stream_ratio);
    let settings = opened_with.lock().unwrap().unwrap();
    assert_eq!((settings.width, settings.height), (width, height));
    assert_eq!(settings.bitrate, bitrate_for_dim(width, height));

    let addr = h.supervisor.server_addr().unwrap();
    let jpeg = net::fetch_jpeg(&format!("http://{}/?action=snapshot", addr)).unwrap();
    assert!(jpeg.starts_with(&SOI));
    assert!(jpeg.ends_with(&EOI));

    let encoder = h.supervisor.processes()[0].current().unwrap();
    h.supervisor.restore();
    assert!(camera.is_closed());
    assert!(!net::port_open("127.0.0.1", addr.port()));
    assert!(h.supervisor.server_addr().is_none());
    assert_eq!(h.legacy.starts(), 1);
    assert!(encoder.wait_exit(Duration::from_secs(5)).is_some());
    assert!(!h.alerts.has_cause("encoder"));

    // Idempotent
    h.supervisor.restore();
    assert_eq!(h.legacy.starts(), 2);
    assert!(h.reporter.messages().is_empty());
}

#[test]
fn test_no_camera_restores_legacy_daemon() {
    let h = harness(|_| {}, FakeHardware::new(true, None, false));

    h.supervisor.run();
    assert_eq!(h.supervisor.mode(), None);
    assert!(h.supervisor.processes().is_empty());
    assert_eq!(h.legacy.stops(), 1);
    assert_eq!(h.legacy.starts(), 1);
    assert!(!h.alerts.has_cause(cause::STREAMING));
    assert!(h.supervisor.is_shutting_down());
}

#[test]
fn test_run_only_once() {
    let h = harness(|_| {}, FakeHardware::new(true, None, false));
    h.supervisor.run();
    h.supervisor.run();
    assert_eq!(h.legacy.stops(), 1);
}

#[test]
fn test_free_tier_reencodes_legacy_stream() {
    let legacy = LegacyEndpoint::start(320, 240);
    let camera = Arc::new(FakeCamera::new(64, 48, Duration::from_millis(10)));
    let h = harness(
        |c| {
            c.streaming.tier = SubscriptionTier::Free;
            c.legacy.snapshot_url = legacy.url("snapshot");
            c.legacy.stream_url = legacy.url("stream");
        },
        FakeHardware::new(true, Some(camera.clone()), false),
    );

    h.supervisor.run();
    assert_eq!(h.supervisor.mode(), Some(PipelineMode::CompatibilityReencode));
    assert_eq!(h.legacy.stops(), 0);
    assert_eq!(h.legacy.starts(), 1);
    assert!(!camera.is_recording());
    assert!(h.supervisor.server_addr().is_none());

    let command = encoder_command(&h.supervisor);
    assert!(command.contains("fps=5"), "{}", command);
    assert!(command.contains("100000"), "{}", command);
    assert!(command.contains("320x240"), "{}", command);
    assert!(command.contains(&legacy.url("stream")), "{}", command);

    h.supervisor.restore();
    assert_eq!(h.legacy.starts(), 2);
}

#[test]
fn test_timelapse_plugin_forces_compat_with_alert() {
    let legacy = LegacyEndpoint::start(640, 480);
    let h = harness(
        |c| {
            c.streaming.timelapse_plugin_enabled = true;
            c.legacy.snapshot_url = legacy.url("snapshot");
            c.legacy.stream_url = legacy.url("stream");
        },
        FakeHardware::new(true, None, true),
    );

    h.supervisor.run();
    assert_eq!(h.supervisor.mode(), Some(PipelineMode::CompatibilityReencode));
    assert!(h.alerts.has_cause(cause::TIMELAPSE_COMPAT_MODE));
    assert!(encoder_command(&h.supervisor).contains("fps=25"));
    h.supervisor.restore();
}

#[test]
fn test_usb_pipeline_serves_ingested_frames() {
    let h = harness(|_| {}, FakeHardware::new(true, None, true));

    h.supervisor.run();
    assert_eq!(h.supervisor.mode(), Some(PipelineMode::UsbPassthroughGateway));
    let config = h.supervisor.config().clone();
    assert!(encoder_command(&h.supervisor).contains(&format!(
        "udp://127.0.0.1:{}",
        config.usb.ingest_port
    )));

    let jpeg = synthetic_jpeg(64, 48);
    let mut entry = b"Content-type: image/jpeg\r\n\r\n".to_vec();
    entry.extend_from_slice(&jpeg);
    entry.extend_from_slice(b"\r\n--ffmpeg\r\n");
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    for chunk in entry.chunks(1024) {
        sender.send_to(chunk, ("127.0.0.1", config.usb.ingest_port)).unwrap();
    }

    let addr = h.supervisor.server_addr().unwrap();
    let served = net::fetch_jpeg(&format!("http://{}/?action=snapshot", addr)).unwrap();
    assert_eq!(&served[..], &jpeg[..]);

    h.supervisor.restore();
    assert!(!net::port_open("127.0.0.1", addr.port()));
    assert!(!h.alerts.has_cause(cause::STREAMING));
}

#[test]
fn test_busy_camera_module_takes_usb_path() {
    let camera = Arc::new(FakeCamera::new(64, 48, Duration::from_millis(10)));
    let hardware = FakeHardware::new(true, Some(camera.clone()), true);
    hardware.module_busy.store(true, Ordering::SeqCst);
    let h = harness(|_| {}, hardware);

    h.supervisor.run();
    assert_eq!(h.supervisor.mode(), Some(PipelineMode::UsbPassthroughGateway));
    assert!(!camera.is_recording());
    assert!(h.reporter.messages().is_empty());

    h.supervisor.restore();
    assert!(!h.alerts.has_cause(cause::STREAMING));
}

#[test]
fn test_failed_muxer_falls_back_to_compat() {
    let legacy = LegacyEndpoint::start(640, 480);
    let h = harness(
        |c| {
            c.usb.muxer_command = Some("sh -c exit".to_string());
            c.usb.muxer_start_attempts = 2;
            c.usb.muxer_grace_polls = 1;
            c.legacy.snapshot_url = legacy.url("snapshot");
            c.legacy.stream_url = legacy.url("stream");
        },
        FakeHardware::new(true, None, true),
    );

    h.supervisor.run();
    assert_eq!(h.supervisor.mode(), Some(PipelineMode::CompatibilityReencode));
    let roles: Vec<_> = h.supervisor.processes().iter().map(|p| p.role()).collect();
    assert_eq!(roles, vec![ProcessRole::Encoder]);
    assert_eq!(h.legacy.stops(), 1);
    assert_eq!(h.legacy.starts(), 1);
    h.supervisor.restore();
}

#[test]
fn test_usb_failure_without_compat_reports_and_restores() {
    let h = harness(
        |c| {
            c.streaming.compatible_mode = CompatibleMode::Never;
            c.encoder.binary = "/nonexistent/encoder".into();
        },
        FakeHardware::new(true, None, true),
    );

    h.supervisor.run();
    assert_eq!(h.supervisor.mode(), None);
    assert!(h.alerts.has_cause(cause::STREAMING));
    assert_eq!(h.reporter.messages().len(), 1);
    assert_eq!(h.legacy.starts(), 1);
    assert!(h.supervisor.server_addr().is_none());
}

#[test]
fn test_exclusive_marker_skips_run() {
    let h = harness(|_| {}, FakeHardware::new(true, None, true));
    std::fs::write(&h.supervisor.config().streaming.exclusive_use_marker, b"").unwrap();

    h.supervisor.run();
    assert_eq!(h.supervisor.mode(), None);
    assert_eq!(h.legacy.stops(), 0);
    assert_eq!(h.legacy.starts(), 0);
}

/// Accept one websocket client and record the first text message it sends.
fn spawn_signaling_endpoint() -> (u16, crossbeam_channel::Receiver<String>) {
    use futures_util::StreamExt;
    use tokio_tungstenite::tungstenite::Message;

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = crossbeam_channel::unbounded();
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                if let Message::Text(text) = message {
                    tx.send(text.as_str().to_string()).ok();
                    break;
                }
            }
        });
    });
    (port, rx)
}

#[test]
fn test_signaling_reaches_external_gateway() {
    let (ws_port, received) = spawn_signaling_endpoint();
    let camera = Arc::new(FakeCamera::new(64, 48, Duration::from_millis(10)));
    let h = harness(
        |c| {
            c.gateway.external = true;
            c.gateway.tunnel_enabled = true;
            c.gateway.ws_port = ws_port;
            c.gateway.subprotocol = String::new();
        },
        FakeHardware::new(true, Some(camera), false),
    );

    h.supervisor.run();
    assert_eq!(h.supervisor.mode(), Some(PipelineMode::NativeCodecGateway));

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !h.supervisor.send_to_gateway("offer") {
        assert!(std::time::Instant::now() < deadline, "tunnel never connected");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(received.recv_timeout(Duration::from_secs(5)).unwrap(), "offer");

    h.supervisor.restore();
    assert!(!h.supervisor.send_to_gateway("late"));
}
