//! Configuration management for the streaming supervisor
//!
//! Provides loading, saving and validation of the settings that pick the
//! pipeline mode, the external binaries to launch, the serving port and the
//! retry/backoff bounds used by every supervision loop.

use crate::errors::{Result, StreamError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an externally managed gateway host.
pub const GATEWAY_HOST_ENV: &str = "JANUS_SERVER";

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    pub streaming: StreamingConfig,
    pub server: ServerConfig,
    pub encoder: EncoderConfig,
    pub camera: CameraConfig,
    pub usb: UsbConfig,
    pub gateway: GatewayConfig,
    pub legacy: LegacyConfig,
    pub supervision: SupervisionConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Free,
    Pro,
}

impl SubscriptionTier {
    /// Whether this tier may use the gateway pipelines.
    pub fn has_gateway_access(self) -> bool {
        self == SubscriptionTier::Pro
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompatibleMode {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPreset {
    Low,
    Medium,
    High,
    UltraHigh,
}

impl ResolutionPreset {
    /// Camera module resolution for the given stream ratio.
    pub fn resolution(self, ratio: StreamRatio) -> (u32, u32) {
        let (four_three, sixteen_nine) = match self {
            ResolutionPreset::Low => ((320, 240), (480, 270)),
            ResolutionPreset::Medium => ((640, 480), (960, 540)),
            ResolutionPreset::High => ((1296, 972), (1640, 922)),
            ResolutionPreset::UltraHigh => ((1640, 1232), (1920, 1080)),
        };
        match ratio {
            StreamRatio::FourThree => four_three,
            StreamRatio::SixteenNine => sixteen_nine,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamRatio {
    #[serde(rename = "4:3")]
    FourThree,
    #[serde(rename = "16:9")]
    SixteenNine,
}

/// Mode selection inputs supplied by the host application
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub tier: SubscriptionTier,
    pub compatible_mode: CompatibleMode,
    /// Whether the time-lapse plugin reports itself as enabled
    pub timelapse_plugin_enabled: bool,
    /// Marker file whose presence means another component owns the camera
    pub exclusive_use_marker: PathBuf,
}

/// Local MJPEG server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Delay between parts of the multipart stream in milliseconds
    pub stream_interval_ms: u64,
    /// Captures closer than this to "now" are treated as possibly stale
    pub stale_threshold_ms: u64,
    /// Extra frames a snapshot may discard while captures look stale
    pub stale_retries: u32,
    /// Upper bound on waiting for any frame in milliseconds
    pub frame_timeout_ms: u64,
    /// Number of frames kept by the USB ingest ring
    pub ring_capacity: usize,
    /// Bytes accepted without a part boundary before the ingest aborts
    pub ingest_max_bytes: usize,
}

/// External encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub binary: PathBuf,
    /// Scheduling niceness; `None` launches the encoder unchanged
    pub niceness: Option<i32>,
    pub rtp_port: u16,
    pub packet_size: u32,
    pub cpu_max_percent: f32,
    pub cpu_interval_secs: u64,
    pub log_tail_lines: usize,
}

/// Camera module configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub resolution: ResolutionPreset,
    pub stream_ratio: StreamRatio,
    pub framerate: u32,
    /// Camera initialization attempts before giving up
    pub init_attempts: u32,
    /// Device node probed for the camera module; records H.264
    pub device: PathBuf,
    /// Device node that delivers JPEG stills alongside the recording
    pub still_device: PathBuf,
}

/// USB capture device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbConfig {
    pub device: PathBuf,
    /// Loopback UDP port the encoder's MJPEG side stream is sent to
    pub ingest_port: u16,
    /// Optional muxing helper that replaces the encoder in USB mode
    pub muxer_command: Option<String>,
    /// Loopback TCP port where the muxer serves MJPEG
    pub passthrough_port: u16,
    pub muxer_start_attempts: u32,
    pub muxer_grace_polls: u32,
}

/// Signaling gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    /// Set when the gateway is managed elsewhere; no gateway process is started
    pub external: bool,
    pub command: Option<String>,
    pub ws_port: u16,
    pub ws_path: String,
    pub subprotocol: String,
    pub tunnel_enabled: bool,
    pub ready_attempts: u32,
}

/// Legacy streaming daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LegacyConfig {
    pub start_command: String,
    pub stop_command: String,
    pub stream_url: String,
    pub snapshot_url: String,
    pub first_frame_attempts: u32,
}

/// Backoff and retry bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisionConfig {
    pub backoff_min_ms: u64,
    pub restart_backoff_max_secs: u64,
    pub tunnel_backoff_max_secs: u64,
    pub port_wait_attempts: u32,
    pub alert_dedup_secs: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            tier: SubscriptionTier::Pro,
            compatible_mode: CompatibleMode::Auto,
            timelapse_plugin_enabled: false,
            exclusive_use_marker: std::env::temp_dir().join(".using_picam"),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            stream_interval_ms: 150,
            stale_threshold_ms: 100,
            stale_retries: 2,
            frame_timeout_ms: 5000,
            ring_capacity: 512,
            ingest_max_bytes: 16 * 1024 * 1024,
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("bin/ffmpeg"),
            niceness: Some(10),
            rtp_port: 8004,
            packet_size: 1300,
            cpu_max_percent: 80.0,
            cpu_interval_secs: 20,
            log_tail_lines: 50,
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            resolution: ResolutionPreset::Medium,
            stream_ratio: StreamRatio::FourThree,
            framerate: 20,
            init_attempts: 5,
            device: PathBuf::from("/dev/video0"),
            still_device: PathBuf::from("/dev/video1"),
        }
    }
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/video0"),
            ingest_port: 14498,
            muxer_command: None,
            passthrough_port: 14499,
            muxer_start_attempts: 9,
            muxer_grace_polls: 5,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            external: false,
            command: None,
            ws_port: 8188,
            ws_path: "/".to_string(),
            subprotocol: "janus-protocol".to_string(),
            tunnel_enabled: true,
            ready_attempts: 10,
        }
    }
}

impl Default for LegacyConfig {
    fn default() -> Self {
        Self {
            start_command: "sudo service webcamd start".to_string(),
            stop_command: "sudo service webcamd stop".to_string(),
            stream_url: "http://127.0.0.1:8080/webcam/?action=stream".to_string(),
            snapshot_url: "http://127.0.0.1:8080/webcam/?action=snapshot".to_string(),
            first_frame_attempts: 4,
        }
    }
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            backoff_min_ms: 1000,
            restart_backoff_max_secs: 600,
            tunnel_backoff_max_secs: 120,
            port_wait_attempts: 10,
            alert_dedup_secs: 60,
        }
    }
}

impl ServerConfig {
    pub fn stream_interval(&self) -> Duration {
        Duration::from_millis(self.stream_interval_ms)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl SupervisionConfig {
    pub fn backoff_min(&self) -> Duration {
        Duration::from_millis(self.backoff_min_ms)
    }

    pub fn restart_backoff_max(&self) -> Duration {
        Duration::from_secs(self.restart_backoff_max_secs)
    }

    pub fn tunnel_backoff_max(&self) -> Duration {
        Duration::from_secs(self.tunnel_backoff_max_secs)
    }
}

impl GatewayConfig {
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}{}", self.host, self.ws_port, self.ws_path)
    }
}

fn config_err(action: &str, path: &Path, e: impl std::fmt::Display) -> StreamError {
    StreamError::Config(format!("cannot {} {}: {}", action, path.display(), e))
}

impl StreamerConfig {
    /// Read `path` as TOML, then apply environment overrides. A missing file
    /// means every section keeps its defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = match fs::read_to_string(path) {
            Ok(contents) => {
                log::info!("Loaded configuration from {}", path.display());
                toml::from_str(&contents).map_err(|e| config_err("parse", path, e))?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No configuration at {}, using defaults", path.display());
                Self::default()
            }
            Err(e) => return Err(config_err("read", path, e)),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let text = toml::to_string_pretty(self).map_err(|e| config_err("serialize", path, e))?;
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| config_err("create directory for", path, e))?;
        }
        fs::write(path, text).map_err(|e| config_err("write", path, e))?;
        log::debug!("Wrote configuration to {}", path.display());
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        PathBuf::from("picam-streamer.toml")
    }

    /// [`load_from_file`](Self::load_from_file) on the default path. Any
    /// error, invalid values included, falls back to the defaults.
    pub fn load_or_default() -> Self {
        let loaded = Self::load_from_file(Self::default_path())
            .and_then(|config| config.validate().map(|()| config));
        loaded.unwrap_or_else(|e| {
            log::warn!("{}; using default configuration", e);
            let mut config = Self::default();
            config.apply_env_overrides();
            config
        })
    }

    /// An externally managed gateway host replaces the local one.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var(GATEWAY_HOST_ENV) {
            if !host.is_empty() {
                log::info!("Using external gateway at {}", host);
                self.gateway.host = host;
                self.gateway.external = true;
            }
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(StreamError::Config(msg.to_string()));

        if self.server.port == 0 {
            return invalid("Server port must be non-zero");
        }
        if self.server.ring_capacity == 0 {
            return invalid("Ring capacity must be at least 1");
        }
        if self.server.ingest_max_bytes < 4 * 1024 {
            return invalid("Ingest memory cap must be at least one datagram (4 KiB)");
        }
        if self.encoder.binary.as_os_str().is_empty() {
            return invalid("Encoder binary must be set");
        }
        if self.encoder.cpu_max_percent <= 0.0 {
            return invalid("CPU threshold must be a positive percentage");
        }
        if self.encoder.log_tail_lines == 0 {
            return invalid("Log tail must keep at least one line");
        }
        if self.camera.framerate == 0 || self.camera.framerate > 90 {
            return invalid("Camera framerate must be 1-90");
        }
        if self.camera.init_attempts == 0 {
            return invalid("Camera init attempts must be at least 1");
        }
        if self.supervision.backoff_min_ms == 0 {
            return invalid("Minimum backoff must be non-zero");
        }
        if self.supervision.restart_backoff_max() < self.supervision.backoff_min() {
            return invalid("Restart backoff cap is below the minimum backoff");
        }
        if self.supervision.tunnel_backoff_max() < self.supervision.backoff_min() {
            return invalid("Tunnel backoff cap is below the minimum backoff");
        }

        Ok(())
    }
}
