//! Top-level pipeline orchestration.
//!
//! [`StreamSupervisor::run`] picks one [`PipelineMode`] for the lifetime of
//! the process, starts the processes and servers that mode needs in
//! dependency order, and routes every setup failure through
//! [`StreamSupervisor::restore`], which hands the camera and the serving port
//! back to the legacy daemon.

use crate::alerts::{cause, Alert, AlertSink, CrashReporter};
use crate::backoff::{retry, Backoff};
use crate::config::{CompatibleMode, StreamerConfig};
use crate::context::RunContext;
use crate::errors::{Result, StreamError};
use crate::media::jpeg::image_dimensions;
use crate::media::{
    CameraFrameSource, FrameSource, MediaServer, MediaServerHandle, PassthroughFrameSource,
    RingFrameSource,
};
use crate::net;
use crate::platform::{CameraModule, CameraSettings, Hardware, LegacyDaemon};
use crate::process::{
    CommandLine, CpuLimit, EncoderCommands, ProcessRole, ProcessSupervisor, RestartPolicy,
};
use crate::tunnel::{TunnelRelay, UpstreamSink};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

const SERVER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const MUXER_GRACE_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineMode {
    /// Camera module H.264 copied straight into RTP; frames served locally.
    NativeCodecGateway,
    /// USB capture device encoded (or muxed) to RTP; MJPEG side stream served locally.
    UsbPassthroughGateway,
    /// The legacy daemon's MJPEG stream re-encoded to RTP; the daemon keeps serving.
    CompatibilityReencode,
}

impl PipelineMode {
    pub const ALL: [PipelineMode; 3] = [
        PipelineMode::NativeCodecGateway,
        PipelineMode::UsbPassthroughGateway,
        PipelineMode::CompatibilityReencode,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineMode::NativeCodecGateway => "native",
            PipelineMode::UsbPassthroughGateway => "usb",
            PipelineMode::CompatibilityReencode => "compat",
        }
    }

    /// Whether this mode binds its own MediaServer.
    pub fn serves_locally(self) -> bool {
        !matches!(self, PipelineMode::CompatibilityReencode)
    }
}

impl fmt::Display for PipelineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the supervisor talks to outside this crate.
#[derive(Clone)]
pub struct Collaborators {
    pub hardware: Arc<dyn Hardware>,
    pub legacy: Arc<dyn LegacyDaemon>,
    pub alerts: Arc<dyn AlertSink>,
    pub reporter: Arc<dyn CrashReporter>,
    pub upstream: Arc<dyn UpstreamSink>,
}

#[derive(Default)]
struct PipelineState {
    mode: Option<PipelineMode>,
    processes: Vec<ProcessSupervisor>,
    server: Option<MediaServerHandle>,
    camera: Option<Arc<dyn CameraModule>>,
    tunnel: Option<TunnelRelay>,
    gateway_started: bool,
    legacy_stopped: bool,
}

struct Inner {
    config: StreamerConfig,
    hardware: Arc<dyn Hardware>,
    legacy: Arc<dyn LegacyDaemon>,
    upstream: Arc<dyn UpstreamSink>,
    ctx: RunContext,
    started: AtomicBool,
    state: Mutex<PipelineState>,
}

/// Owns one streaming run.
#[derive(Clone)]
pub struct StreamSupervisor {
    inner: Arc<Inner>,
}

impl StreamSupervisor {
    pub fn new(config: StreamerConfig, collaborators: Collaborators) -> Self {
        let ctx = RunContext::new(collaborators.alerts, collaborators.reporter);
        Self {
            inner: Arc::new(Inner {
                config,
                hardware: collaborators.hardware,
                legacy: collaborators.legacy,
                upstream: collaborators.upstream,
                ctx,
                started: AtomicBool::new(false),
                state: Mutex::new(PipelineState::default()),
            }),
        }
    }

    pub fn config(&self) -> &StreamerConfig {
        &self.inner.config
    }

    pub fn context(&self) -> &RunContext {
        &self.inner.ctx
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.ctx.is_shutting_down()
    }

    pub fn mode(&self) -> Option<PipelineMode> {
        self.state().mode
    }

    pub fn processes(&self) -> Vec<ProcessSupervisor> {
        self.state().processes.clone()
    }

    /// Command lines of every process started in this run.
    pub fn process_commands(&self) -> Vec<(ProcessRole, CommandLine)> {
        self.state()
            .processes
            .iter()
            .map(|p| (p.role(), p.command().clone()))
            .collect()
    }

    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.state().server.as_ref().map(|s| s.local_addr())
    }

    /// Relay a signaling message to the gateway. Dropped when the tunnel is
    /// not connected.
    pub fn send_to_gateway(&self, message: &str) -> bool {
        let tunnel = self.state().tunnel.clone();
        match tunnel {
            Some(tunnel) => tunnel.send(message),
            None => false,
        }
    }

    /// Run the pipeline on a background thread.
    pub fn spawn(&self) -> std::io::Result<JoinHandle<()>> {
        let supervisor = self.clone();
        std::thread::Builder::new()
            .name("stream-supervisor".to_string())
            .spawn(move || supervisor.run())
    }

    /// Select a mode and start it. Only the first call does anything;
    /// failures are alerted and end in [`restore`](Self::restore).
    pub fn run(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            log::debug!("Stream supervisor already ran");
            return;
        }
        if !self.inner.hardware.is_supported() {
            log::warn!("Not running on supported hardware. Quitting video pipeline.");
            return;
        }
        let marker = &self.inner.config.streaming.exclusive_use_marker;
        if marker.exists() {
            log::warn!(
                "{} exists; another component is using the camera. Not streaming.",
                marker.display()
            );
            return;
        }

        match self.start_pipeline() {
            // restore() raced with startup; release whatever came up after it.
            Ok(_) if self.is_shutting_down() => self.restore(),
            Ok(mode) => log::info!("Streaming pipeline running in {} mode", mode),
            Err(StreamError::HardwareUnavailable(reason)) => {
                log::warn!("{}. Skipping webcam streaming", reason);
                self.restore();
            }
            Err(e) => self.fail(e),
        }
    }

    /// Tear down everything this run started and hand the camera and port
    /// back to the legacy daemon. Safe to call at any time, any number of
    /// times; each step runs even if an earlier one failed.
    pub fn restore(&self) {
        log::info!("Restoring legacy streaming");
        let ctx = &self.inner.ctx;
        ctx.begin_shutdown();

        let (tunnel, held_port) = {
            let mut state = self.state();
            (
                state.tunnel.take(),
                state.legacy_stopped || state.server.is_some(),
            )
        };

        self.release_media(true);
        if let Some(tunnel) = tunnel {
            tunnel.stop();
        }

        if held_port {
            self.wait_port_released();
        }

        match self.inner.legacy.start() {
            Ok(()) => self.state().legacy_stopped = false,
            Err(e) => log::warn!("Failed to start legacy daemon: {}", e),
        }
        self.state().gateway_started = false;
    }

    fn state(&self) -> MutexGuard<'_, PipelineState> {
        self.inner.state.lock().expect("lock poisoned")
    }

    fn wait_backoff(&self) -> Backoff {
        let supervision = &self.inner.config.supervision;
        Backoff::new(supervision.backoff_min(), supervision.tunnel_backoff_max())
    }

    fn fail(&self, e: StreamError) {
        log::error!("Streaming pipeline failed: {}", e);
        self.inner
            .ctx
            .alert(Alert::warning(cause::STREAMING).with_detail(e.to_string()));

        // A server that is still starting would miss the shutdown request.
        if let Some(addr) = self.server_addr() {
            let tries = self.inner.config.supervision.port_wait_attempts;
            let host = addr.ip().to_string();
            if let Err(wait) = net::wait_for_port(&host, addr.port(), &mut self.wait_backoff(), tries) {
                log::debug!("Media server never came up: {}", wait);
            }
        }

        self.restore();
        self.inner.ctx.reporter().capture_error(&e);
    }

    fn start_pipeline(&self) -> Result<PipelineMode> {
        let mode = if self.wants_compat() {
            self.start_compat()?;
            PipelineMode::CompatibilityReencode
        } else {
            self.stop_legacy();
            match self.init_camera()? {
                Some(camera) => {
                    self.start_native(camera)?;
                    PipelineMode::NativeCodecGateway
                }
                None if self.inner.hardware.usb_device_present(&self.inner.config.usb.device) => {
                    log::debug!("v4l2 device found! Streaming as USB camera.");
                    match self.start_usb() {
                        Ok(()) => PipelineMode::UsbPassthroughGateway,
                        Err(e)
                            if e.is_recoverable()
                                && self.inner.config.streaming.compatible_mode
                                    != CompatibleMode::Never =>
                        {
                            log::warn!("USB pipeline failed ({}); falling back to compatibility mode", e);
                            self.release_media(false);
                            self.start_compat()?;
                            PipelineMode::CompatibilityReencode
                        }
                        Err(e) => return Err(e),
                    }
                }
                None => {
                    return Err(StreamError::HardwareUnavailable(
                        "No camera detected".to_string(),
                    ))
                }
            }
        };
        self.state().mode = Some(mode);
        Ok(mode)
    }

    fn wants_compat(&self) -> bool {
        let streaming = &self.inner.config.streaming;
        if !streaming.tier.has_gateway_access() {
            return true;
        }
        match streaming.compatible_mode {
            CompatibleMode::Always => true,
            CompatibleMode::Never => false,
            CompatibleMode::Auto if streaming.timelapse_plugin_enabled => {
                log::warn!("Time-lapse plugin is enabled. Switching to compat mode.");
                self.inner
                    .ctx
                    .alert(Alert::warning(cause::TIMELAPSE_COMPAT_MODE));
                true
            }
            CompatibleMode::Auto => false,
        }
    }

    fn stop_legacy(&self) {
        if let Err(e) = self.inner.legacy.stop() {
            log::warn!("Failed to stop legacy daemon: {}", e);
        }
        self.state().legacy_stopped = true;
    }

    fn init_camera(&self) -> Result<Option<Arc<dyn CameraModule>>> {
        let settings = CameraSettings::from_config(&self.inner.config.camera);
        let mut backoff = self.wait_backoff();
        let opened = retry(&mut backoff, self.inner.config.camera.init_attempts, |attempt| {
            log::debug!("Opening camera module (attempt {})", attempt);
            self.inner.hardware.open_camera_module(&settings)
        });
        match opened {
            Err(StreamError::HardwareUnavailable(reason)) => {
                log::warn!("Camera module unusable ({}); looking for a USB camera", reason);
                Ok(None)
            }
            other => other,
        }
    }

    /// Start the gateway process (if managed here) and the tunnel. Runs once
    /// per run regardless of how many modes are tried.
    fn start_gateway(&self) -> Result<()> {
        if self.state().gateway_started {
            return Ok(());
        }
        let config = &self.inner.config;
        let gateway = &config.gateway;

        if let (false, Some(line)) = (gateway.external, gateway.command.as_deref()) {
            let command = CommandLine::parse(line)
                .ok_or_else(|| StreamError::Config("Empty gateway command".to_string()))?;
            let process = ProcessSupervisor::new(
                ProcessRole::Gateway,
                command,
                RestartPolicy::Never,
                config.encoder.log_tail_lines,
                self.inner.ctx.clone(),
            );
            self.state().processes.push(process.clone());
            process.start()?;
            net::wait_for_port(
                &gateway.host,
                gateway.ws_port,
                &mut self.wait_backoff(),
                gateway.ready_attempts,
            )?;
        }

        if gateway.tunnel_enabled {
            let mut tunnel = TunnelRelay::new(
                gateway.ws_url(),
                gateway.subprotocol.clone(),
                Backoff::new(
                    config.supervision.backoff_min(),
                    config.supervision.tunnel_backoff_max(),
                ),
                self.inner.ctx.clone(),
                self.inner.upstream.clone(),
            );
            let pipeline = Arc::downgrade(&self.inner);
            tunnel = tunnel.with_keepalive(move || {
                let Some(inner) = pipeline.upgrade() else {
                    return false;
                };
                let processes = inner.state.lock().expect("lock poisoned").processes.clone();
                tunnel_wanted(&processes)
            });
            tunnel.start()?;
            self.state().tunnel = Some(tunnel);
        }

        self.state().gateway_started = true;
        Ok(())
    }

    /// Encoder under the no-restart policy with the CPU watchdog attached.
    fn encoder(&self, command: CommandLine) -> ProcessSupervisor {
        let encoder = &self.inner.config.encoder;
        let process = ProcessSupervisor::new(
            ProcessRole::Encoder,
            command,
            RestartPolicy::Never,
            encoder.log_tail_lines,
            self.inner.ctx.clone(),
        )
        .with_cpu_limit(CpuLimit {
            max_percent: encoder.cpu_max_percent,
            interval: Duration::from_secs(encoder.cpu_interval_secs),
        });
        self.state().processes.push(process.clone());
        process
    }

    fn encoder_commands(&self) -> EncoderCommands<'_> {
        EncoderCommands::new(&self.inner.config.encoder, &self.inner.config.gateway.host)
    }

    fn start_server<S: FrameSource>(&self, source: Arc<S>) -> Result<()> {
        let server = &self.inner.config.server;
        let handle = MediaServer::start(&server.host, server.port, source)?;
        self.state().server = Some(handle);
        Ok(())
    }

    fn start_native(&self, camera: Arc<dyn CameraModule>) -> Result<()> {
        self.state().camera = Some(camera.clone());
        self.start_gateway()?;

        let process = self.encoder(self.encoder_commands().native()).start()?;

        let source = Arc::new(CameraFrameSource::new(&self.inner.config.server));
        self.start_server(source.clone())?;

        let stdin = process
            .take_stdin()
            .ok_or_else(|| StreamError::start_failure("encoder", "standard input unavailable"))?;
        camera.start_recording(Box::new(stdin))?;
        source.start_capture(camera, self.inner.ctx.clone())?;
        Ok(())
    }

    fn start_usb(&self) -> Result<()> {
        self.start_gateway()?;
        let config = &self.inner.config;
        let usb = &config.usb;

        match usb.muxer_command.as_deref().and_then(CommandLine::parse) {
            Some(command) => {
                let muxer = ProcessSupervisor::new(
                    ProcessRole::Muxer,
                    command,
                    RestartPolicy::Backoff {
                        min: config.supervision.backoff_min(),
                        max: config.supervision.restart_backoff_max(),
                    },
                    config.encoder.log_tail_lines,
                    self.inner.ctx.clone(),
                );
                self.state().processes.push(muxer.clone());

                // The device may still be held briefly by the legacy daemon.
                let grace = MUXER_GRACE_POLL * usb.muxer_grace_polls;
                let mut backoff = self.wait_backoff();
                retry(&mut backoff, usb.muxer_start_attempts, |attempt| {
                    log::debug!("Starting muxer (attempt {})", attempt);
                    muxer.start_verified(grace)
                })?;

                let addr = SocketAddr::from(([127, 0, 0, 1], usb.passthrough_port));
                self.start_server(Arc::new(PassthroughFrameSource::new(
                    addr,
                    config.server.ingest_max_bytes,
                    config.server.frame_timeout(),
                )))?;
            }
            None => {
                let command = self.encoder_commands().usb(&usb.device, usb.ingest_port);
                self.encoder(command).start()?;

                let source = Arc::new(RingFrameSource::new(
                    config.server.ring_capacity,
                    config.server.ingest_max_bytes,
                ));
                self.start_server(source.clone())?;

                let supervisor = self.clone();
                source.start_ingest(usb.ingest_port, self.inner.ctx.clone(), move |e| {
                    supervisor.fail(e)
                })?;
            }
        }
        Ok(())
    }

    fn start_compat(&self) -> Result<()> {
        self.start_gateway()?;

        let held_port = {
            let state = self.state();
            state.legacy_stopped || state.server.is_some()
        };
        if held_port {
            self.wait_port_released();
        }
        match self.inner.legacy.start() {
            Ok(()) => self.state().legacy_stopped = false,
            Err(e) => log::warn!("Failed to start legacy daemon: {}", e),
        }

        let config = &self.inner.config;
        let legacy = &config.legacy;
        let mut backoff = self.wait_backoff();
        let jpeg = retry(&mut backoff, legacy.first_frame_attempts, |_| {
            net::fetch_jpeg(&legacy.snapshot_url)
        })?;
        let (width, height) = image_dimensions(&jpeg)?;
        log::debug!("Legacy stream is {}x{}", width, height);

        let command =
            self.encoder_commands()
                .compat(&legacy.stream_url, config.streaming.tier, width, height);
        self.encoder(command).start()?;
        Ok(())
    }

    /// Stop the media server, the camera and the processes feeding them.
    /// Gateway processes are included only when `with_gateway` is set.
    fn release_media(&self, with_gateway: bool) {
        let (server, processes, camera) = {
            let mut state = self.state();
            let (released, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.processes)
                .into_iter()
                .partition(|p| with_gateway || p.role() != ProcessRole::Gateway);
            state.processes = kept;
            (state.server.take(), released, state.camera.take())
        };

        if let Some(server) = &server {
            if let Err(e) = net::post_shutdown(&format!("http://{}", server.local_addr())) {
                log::debug!("Shutdown request to media server failed: {}", e);
            }
            server.shutdown();
        }

        for process in &processes {
            process.terminate();
        }

        if let Some(camera) = camera {
            if let Err(e) = camera.stop_recording() {
                log::warn!("Failed to stop camera recording: {}", e);
            }
            if let Err(e) = camera.close() {
                log::warn!("Failed to close camera: {}", e);
            }
        }

        if let Some(server) = server {
            if !server.join(SERVER_JOIN_TIMEOUT) {
                log::warn!("Media server did not stop within {:?}", SERVER_JOIN_TIMEOUT);
            }
        }
    }

    fn wait_port_released(&self) {
        let config = &self.inner.config;
        if let Err(e) = net::wait_for_port_to_close(
            &config.server.host,
            config.server.port,
            &mut self.wait_backoff(),
            config.supervision.port_wait_attempts,
        ) {
            log::warn!("Serving port still busy: {}", e);
        }
    }
}

/// Whether the tunnel should keep reconnecting. A gateway launched here must
/// still be running, and once a muxer or encoder is registered at least one
/// of them must still be expected to run.
fn tunnel_wanted(processes: &[ProcessSupervisor]) -> bool {
    let (gateways, producers): (Vec<_>, Vec<_>) = processes
        .iter()
        .partition(|p| p.role() == ProcessRole::Gateway);
    let gateway_up = gateways
        .iter()
        .all(|p| p.current().is_some_and(|process| process.is_running()));
    gateway_up && (producers.is_empty() || producers.iter().any(|p| p.current().is_some()))
}
