//! Host hardware seams: board detection, the camera module, USB capture
//! devices and the legacy MJPEG daemon.
//!
//! The supervisor only talks to these traits; [`SystemHardware`] and
//! [`legacy::ServiceDaemon`] are the production implementations.

pub mod legacy;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use legacy::{LegacyDaemon, ServiceDaemon};

use crate::config::CameraConfig;
use crate::errors::{Result, StreamError};
use crate::process::bitrate_for_dim;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// Linux errno values a camera probe reports when the module cannot be used.
const EBUSY: i32 = 16;
const ENODEV: i32 = 19;
const EINVAL: i32 = 22;
const ENOTTY: i32 = 25;

/// Map an I/O error from probing a camera device. A busy device, a missing
/// node or an unsupported format means no usable camera module, not a
/// failed pipeline.
pub fn camera_probe_error(context: &str, e: std::io::Error) -> StreamError {
    match e.raw_os_error() {
        Some(EBUSY | ENODEV | EINVAL | ENOTTY) => {
            StreamError::HardwareUnavailable(format!("{}: {}", context, e))
        }
        _ => StreamError::Camera(format!("{}: {}", context, e)),
    }
}

const BOARD_MODEL_PATH: &str = "/proc/device-tree/model";
const SUPPORTED_BOARD: &str = "Raspberry Pi";

/// How the camera module should capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraSettings {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub bitrate: u32,
    /// H.264 quantizer target
    pub quality: u32,
    /// Frames between keyframes
    pub intra_period: u32,
}

impl CameraSettings {
    pub fn from_config(config: &CameraConfig) -> Self {
        let (width, height) = config.resolution.resolution(config.stream_ratio);
        Self {
            width,
            height,
            framerate: config.framerate,
            bitrate: bitrate_for_dim(width, height),
            quality: 23,
            intra_period: 25,
        }
    }
}

/// A camera that records H.264 into a byte sink while also producing JPEG
/// stills. Methods take `&self`: recording and still capture run on
/// different threads.
pub trait CameraModule: Send + Sync {
    /// Begin writing the H.264 elementary stream to `sink`.
    fn start_recording(&self, sink: Box<dyn Write + Send>) -> Result<()>;

    /// Block until the next still is available and return it.
    fn capture_jpeg(&self) -> Result<Vec<u8>>;

    fn stop_recording(&self) -> Result<()>;

    /// Release the device. Further captures fail.
    fn close(&self) -> Result<()>;
}

pub trait Hardware: Send + Sync {
    /// Whether this host can run the pipeline at all.
    fn is_supported(&self) -> bool;

    /// Open and configure the camera module. `Ok(None)` means no module is
    /// attached; errors are transient and may be retried.
    fn open_camera_module(&self, settings: &CameraSettings) -> Result<Option<Arc<dyn CameraModule>>>;

    fn usb_device_present(&self, device: &Path) -> bool;
}

/// Detection against the running host.
#[derive(Debug, Clone)]
pub struct SystemHardware {
    camera_device: PathBuf,
    still_device: PathBuf,
}

impl SystemHardware {
    pub fn new(config: &CameraConfig) -> Self {
        Self {
            camera_device: config.device.clone(),
            still_device: config.still_device.clone(),
        }
    }
}

/// Whether a device-tree model string names a supported board.
pub fn is_supported_board(model: &str) -> bool {
    model.trim_end_matches('\0').contains(SUPPORTED_BOARD)
}

impl Hardware for SystemHardware {
    fn is_supported(&self) -> bool {
        match std::fs::read_to_string(BOARD_MODEL_PATH) {
            Ok(model) => is_supported_board(&model),
            Err(_) => false,
        }
    }

    #[cfg(feature = "v4l2")]
    fn open_camera_module(&self, settings: &CameraSettings) -> Result<Option<Arc<dyn CameraModule>>> {
        let module = v4l2::V4l2CameraModule::open(&self.camera_device, &self.still_device, settings)?;
        Ok(module.map(|m| Arc::new(m) as Arc<dyn CameraModule>))
    }

    #[cfg(not(feature = "v4l2"))]
    fn open_camera_module(&self, _settings: &CameraSettings) -> Result<Option<Arc<dyn CameraModule>>> {
        log::debug!(
            "Camera module support not compiled in; ignoring {} and {}",
            self.camera_device.display(),
            self.still_device.display()
        );
        Ok(None)
    }

    fn usb_device_present(&self, device: &Path) -> bool {
        device.exists()
    }
}
