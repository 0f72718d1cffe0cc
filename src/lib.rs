//! picam-streamer: camera streaming supervisor for printer-attached cameras
//!
//! Feeds the camera to a WebRTC gateway as RTP and serves snapshots and an
//! MJPEG stream on a local HTTP port. One of three pipelines is chosen at
//! startup depending on the hardware present and the account tier:
//!
//! - a camera module whose H.264 is copied straight into RTP,
//! - a USB capture device encoded (or muxed) to RTP with an MJPEG side stream,
//! - the legacy webcam daemon's MJPEG stream, re-encoded.
//!
//! Whatever happens, [`StreamSupervisor::restore`] hands the camera and the
//! serving port back to the legacy daemon.
//!
//! # Usage
//! ```rust,ignore
//! use picam_streamer::{Collaborators, StreamSupervisor, StreamerConfig};
//!
//! let supervisor = StreamSupervisor::new(StreamerConfig::load_or_default(), collaborators);
//! supervisor.spawn()?;
//! // ... on shutdown
//! supervisor.restore();
//! ```
pub mod alerts;
pub mod backoff;
pub mod config;
pub mod context;
pub mod errors;
pub mod media;
pub mod net;
pub mod platform;
pub mod process;
pub mod supervisor;
pub mod tunnel;

// Testing utilities - fakes and synthetic frames for offline testing
pub mod testing;

// Re-exports for convenience
pub use alerts::{Alert, AlertSink, CrashReporter};
pub use backoff::Backoff;
pub use config::StreamerConfig;
pub use context::RunContext;
pub use errors::{Result, StreamError};
pub use supervisor::{Collaborators, PipelineMode, StreamSupervisor};

/// Initialize logging for the streamer
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "picam_streamer=info,webcam_streamer=info");
    }
    let _ = env_logger::try_init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Get crate information
pub fn get_info() -> CrateInfo {
    CrateInfo {
        name: NAME.to_string(),
        version: VERSION.to_string(),
        description: DESCRIPTION.to_string(),
        modes: supervisor::PipelineMode::ALL
            .iter()
            .map(|m| m.as_str().to_string())
            .collect(),
    }
}

/// Crate information structure
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CrateInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    /// Pipeline modes this build can run
    pub modes: Vec<String>,
}
