//! In-memory stand-ins for the hardware and host collaborators.

use crate::alerts::{Alert, AlertSink, CrashReporter};
use crate::context::RunContext;
use crate::errors::{Result, StreamError};
use crate::platform::{CameraModule, CameraSettings, Hardware, LegacyDaemon};
use crate::testing::synthetic_data::synthetic_frame;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Collects every alert it receives, without deduplication.
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlertSink {
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().expect("lock poisoned").clone()
    }

    pub fn has_cause(&self, cause: &str) -> bool {
        self.alerts
            .lock()
            .expect("lock poisoned")
            .iter()
            .any(|a| a.cause == cause)
    }
}

impl AlertSink for RecordingAlertSink {
    fn add_alert(&self, alert: Alert) {
        self.alerts.lock().expect("lock poisoned").push(alert);
    }
}

#[derive(Debug, Default)]
pub struct RecordingCrashReporter {
    messages: Mutex<Vec<String>>,
}

impl RecordingCrashReporter {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().expect("lock poisoned").clone()
    }
}

impl CrashReporter for RecordingCrashReporter {
    fn capture_message(&self, message: &str) {
        self.messages.lock().expect("lock poisoned").push(message.to_string());
    }
}

/// A fresh run context wired to recording sinks.
pub fn test_context() -> (RunContext, Arc<RecordingAlertSink>, Arc<RecordingCrashReporter>) {
    let alerts = Arc::new(RecordingAlertSink::default());
    let reporter = Arc::new(RecordingCrashReporter::default());
    let ctx = RunContext::new(alerts.clone(), reporter.clone());
    (ctx, alerts, reporter)
}

/// Camera module producing synthetic JPEG stills at a fixed interval.
pub struct FakeCamera {
    width: u32,
    height: u32,
    interval: Duration,
    frames: AtomicU64,
    recording: AtomicBool,
    closed: AtomicBool,
    sink: Mutex<Option<Box<dyn Write + Send>>>,
}

impl FakeCamera {
    pub fn new(width: u32, height: u32, interval: Duration) -> Self {
        Self {
            width,
            height,
            interval,
            frames: AtomicU64::new(0),
            recording: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            sink: Mutex::new(None),
        }
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl CameraModule for FakeCamera {
    fn start_recording(&self, mut sink: Box<dyn Write + Send>) -> Result<()> {
        if self.is_closed() {
            return Err(StreamError::Camera("camera closed".to_string()));
        }
        // Annex B start code, enough for a consumer to see data arrive
        sink.write_all(&[0, 0, 0, 1])?;
        *self.sink.lock().expect("lock poisoned") = Some(sink);
        self.recording.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn capture_jpeg(&self) -> Result<Vec<u8>> {
        std::thread::sleep(self.interval);
        if self.is_closed() {
            return Err(StreamError::Camera("camera closed".to_string()));
        }
        let n = self.frames.fetch_add(1, Ordering::SeqCst);
        Ok(synthetic_frame(n, self.width, self.height))
    }

    fn stop_recording(&self) -> Result<()> {
        self.recording.store(false, Ordering::SeqCst);
        self.sink.lock().expect("lock poisoned").take();
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.stop_recording()?;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Configurable host hardware.
pub struct FakeHardware {
    pub supported: bool,
    pub camera: Option<Arc<FakeCamera>>,
    pub usb_present: bool,
    /// Transient open failures to report before succeeding
    pub open_failures: AtomicU32,
    /// Report the camera module as busy on every open
    pub module_busy: AtomicBool,
    /// Settings of the most recent open request
    pub opened_with: Arc<Mutex<Option<CameraSettings>>>,
    open_calls: AtomicU32,
}

impl FakeHardware {
    pub fn new(supported: bool, camera: Option<Arc<FakeCamera>>, usb_present: bool) -> Self {
        Self {
            supported,
            camera,
            usb_present,
            open_failures: AtomicU32::new(0),
            module_busy: AtomicBool::new(false),
            opened_with: Arc::new(Mutex::new(None)),
            open_calls: AtomicU32::new(0),
        }
    }

    pub fn open_calls(&self) -> u32 {
        self.open_calls.load(Ordering::SeqCst)
    }
}

impl Hardware for FakeHardware {
    fn is_supported(&self) -> bool {
        self.supported
    }

    fn open_camera_module(&self, settings: &CameraSettings) -> Result<Option<Arc<dyn CameraModule>>> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        *self.opened_with.lock().expect("lock poisoned") = Some(*settings);
        if self.module_busy.load(Ordering::SeqCst) {
            return Err(StreamError::HardwareUnavailable("open: Device or resource busy".to_string()));
        }
        let pending = self.open_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.open_failures.store(pending - 1, Ordering::SeqCst);
            return Err(StreamError::Camera("camera busy".to_string()));
        }
        Ok(self.camera.clone().map(|c| c as Arc<dyn CameraModule>))
    }

    fn usb_device_present(&self, _device: &Path) -> bool {
        self.usb_present
    }
}

/// Counts start and stop requests.
#[derive(Debug, Default)]
pub struct FakeLegacyDaemon {
    starts: AtomicU32,
    stops: AtomicU32,
}

impl FakeLegacyDaemon {
    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }
}

impl LegacyDaemon for FakeLegacyDaemon {
    fn start(&self) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
