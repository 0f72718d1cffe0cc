//! Camera module backed by Video4Linux2 device nodes.
//!
//! The module exposes two nodes: one encodes H.264 for the recording and
//! one delivers MJPEG stills. Each node is drained on its own thread.

use crate::errors::{Result, StreamError};
use crate::platform::{camera_probe_error, CameraModule, CameraSettings};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use v4l::buffer::Type;
use v4l::io::mmap::Stream as MmapStream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC};

const BUFFER_COUNT: u32 = 4;
const STILL_TIMEOUT: Duration = Duration::from_secs(5);

fn camera_err(context: &str, e: std::io::Error) -> StreamError {
    StreamError::Camera(format!("{}: {}", context, e))
}

/// Open `path` and apply resolution, pixel format and frame rate. Returns
/// `None` if the device does not accept `fourcc`.
fn configure(path: &Path, settings: &CameraSettings, fourcc: FourCC) -> Result<Option<Device>> {
    let device = Device::with_path(path).map_err(|e| camera_probe_error("open", e))?;
    let requested = Format::new(settings.width, settings.height, fourcc);
    let format =
        Capture::set_format(&device, &requested).map_err(|e| camera_probe_error("set format", e))?;
    if format.fourcc != fourcc {
        return Ok(None);
    }
    if format.width != settings.width || format.height != settings.height {
        log::warn!(
            "{} adjusted {}x{} to {}x{}",
            path.display(),
            settings.width,
            settings.height,
            format.width,
            format.height
        );
    }
    let params = v4l::video::capture::Parameters::with_fps(settings.framerate);
    Capture::set_params(&device, &params).map_err(|e| camera_probe_error("set frame rate", e))?;
    Ok(Some(device))
}

pub struct V4l2CameraModule {
    settings: CameraSettings,
    record_device: PathBuf,
    still_device: PathBuf,
    recording: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    recorder: Mutex<Option<JoinHandle<()>>>,
    stills: Mutex<Option<Receiver<Vec<u8>>>>,
}

impl V4l2CameraModule {
    /// Probe `record_device` for an H.264 capable camera module.
    pub fn open(record_device: &Path, still_device: &Path, settings: &CameraSettings) -> Result<Option<Self>> {
        if !record_device.exists() {
            return Ok(None);
        }
        let Some(device) = configure(record_device, settings, FourCC::new(b"H264"))? else {
            log::debug!("{} does not encode H.264", record_device.display());
            return Ok(None);
        };
        if let Ok(caps) = device.query_caps() {
            log::info!("Camera module: {} ({})", caps.card, caps.driver);
        }
        log::debug!(
            "Camera module: framerate: {} - bitrate: {} - resolution: {}x{}",
            settings.framerate,
            settings.bitrate,
            settings.width,
            settings.height
        );
        drop(device);

        Ok(Some(Self {
            settings: *settings,
            record_device: record_device.to_path_buf(),
            still_device: still_device.to_path_buf(),
            recording: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
            recorder: Mutex::new(None),
            stills: Mutex::new(None),
        }))
    }

    fn start_stills(&self) -> Result<Receiver<Vec<u8>>> {
        let (tx, rx) = bounded(2);
        let path = self.still_device.clone();
        let settings = self.settings;
        let closed = self.closed.clone();
        std::thread::Builder::new()
            .name("camera-stills".to_string())
            .spawn(move || {
                if let Err(e) = still_loop(&path, &settings, &closed, tx) {
                    log::error!("Still capture on {} failed: {}", path.display(), e);
                }
            })?;
        Ok(rx)
    }
}

fn still_loop(path: &Path, settings: &CameraSettings, closed: &AtomicBool, tx: Sender<Vec<u8>>) -> Result<()> {
    let device = configure(path, settings, FourCC::new(b"MJPG"))?
        .ok_or_else(|| StreamError::Camera(format!("{} does not deliver MJPEG", path.display())))?;
    let mut stream = MmapStream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT)
        .map_err(|e| camera_err("map still buffers", e))?;
    while !closed.load(Ordering::SeqCst) {
        let (buf, meta) = CaptureStream::next(&mut stream).map_err(|e| camera_err("still capture", e))?;
        let used = (meta.bytesused as usize).min(buf.len());
        match tx.try_send(buf[..used].to_vec()) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => break,
        }
    }
    Ok(())
}

fn record_loop(
    path: &Path,
    settings: &CameraSettings,
    running: &AtomicBool,
    mut sink: Box<dyn Write + Send>,
) -> Result<()> {
    let device = configure(path, settings, FourCC::new(b"H264"))?
        .ok_or_else(|| StreamError::Camera(format!("{} stopped accepting H.264", path.display())))?;
    let mut stream = MmapStream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT)
        .map_err(|e| camera_err("map recording buffers", e))?;
    while running.load(Ordering::SeqCst) {
        let (buf, meta) = CaptureStream::next(&mut stream).map_err(|e| camera_err("recording", e))?;
        let used = (meta.bytesused as usize).min(buf.len());
        sink.write_all(&buf[..used])?;
    }
    sink.flush()?;
    Ok(())
}

impl CameraModule for V4l2CameraModule {
    fn start_recording(&self, sink: Box<dyn Write + Send>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StreamError::Camera("camera closed".to_string()));
        }
        if self.recording.swap(true, Ordering::SeqCst) {
            return Err(StreamError::Camera("already recording".to_string()));
        }
        let path = self.record_device.clone();
        let settings = self.settings;
        let running = self.recording.clone();
        let handle = std::thread::Builder::new()
            .name("camera-h264".to_string())
            .spawn(move || {
                if let Err(e) = record_loop(&path, &settings, &running, sink) {
                    if running.load(Ordering::SeqCst) {
                        log::error!("Recording from {} stopped: {}", path.display(), e);
                    }
                }
                running.store(false, Ordering::SeqCst);
            })?;
        *self.recorder.lock().expect("lock poisoned") = Some(handle);
        Ok(())
    }

    fn capture_jpeg(&self) -> Result<Vec<u8>> {
        let rx = {
            let mut stills = self.stills.lock().expect("lock poisoned");
            match stills.as_ref() {
                Some(rx) => rx.clone(),
                None => {
                    let rx = self.start_stills()?;
                    *stills = Some(rx.clone());
                    rx
                }
            }
        };
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(StreamError::Camera("camera closed".to_string()));
            }
            match rx.recv_timeout(STILL_TIMEOUT) {
                Ok(jpeg) => return Ok(jpeg),
                Err(RecvTimeoutError::Timeout) => {
                    log::warn!("No still from {} in {:?}", self.still_device.display(), STILL_TIMEOUT)
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(StreamError::Camera("still capture ended".to_string()))
                }
            }
        }
    }

    fn stop_recording(&self) -> Result<()> {
        self.recording.store(false, Ordering::SeqCst);
        // The recorder exits after its next buffer; don't wait on a stalled device.
        self.recorder.lock().expect("lock poisoned").take();
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.stop_recording()?;
        self.closed.store(true, Ordering::SeqCst);
        self.stills.lock().expect("lock poisoned").take();
        Ok(())
    }
}
