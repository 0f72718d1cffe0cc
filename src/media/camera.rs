//! Frames captured straight from the camera module.

use crate::config::ServerConfig;
use crate::context::RunContext;
use crate::errors::{Result, StreamError};
use crate::media::jpeg::multipart_part;
use crate::media::queue::{FrameQueue, PopOrder};
use crate::media::{CancelToken, FrameSource, CANCEL_POLL};
use crate::platform::CameraModule;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub const CAMERA_BOUNDARY: &str = "herebedragons";

/// Latest-wins frame slot fed by the camera capture loop.
///
/// Snapshots guard against serving a frame that predates the request: if the
/// capture loop produced the current frame only moments after the previous
/// one, the slot may have been holding a backlog, so a few more frames are
/// pulled before one is trusted.
pub struct CameraFrameSource {
    slot: FrameQueue<Bytes>,
    last_capture: Mutex<Option<Instant>>,
    stale_threshold: Duration,
    stale_retries: u32,
    frame_timeout: Duration,
    stream_interval: Duration,
}

/// Streaming state: number of parts sent on this connection.
#[derive(Debug, Default)]
pub struct CameraStream {
    parts: u64,
}

impl CameraFrameSource {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            slot: FrameQueue::new(1),
            last_capture: Mutex::new(None),
            stale_threshold: config.stale_threshold(),
            stale_retries: config.stale_retries,
            frame_timeout: config.frame_timeout(),
            stream_interval: config.stream_interval(),
        }
    }

    /// Replace the slot's content with a freshly captured frame.
    pub fn publish(&self, jpeg: Bytes) {
        *self.last_capture.lock().expect("lock poisoned") = Some(Instant::now());
        self.slot.push_drop_oldest(jpeg);
    }

    /// Wake blocked readers with an error; later publishes are discarded.
    pub fn close(&self) {
        self.slot.close();
    }

    fn capture_gap(&self) -> Option<Duration> {
        self.last_capture
            .lock()
            .expect("lock poisoned")
            .map(|at| at.elapsed())
    }

    fn next_frame(&self, cancel: &CancelToken) -> Result<Bytes> {
        let deadline = Instant::now() + self.frame_timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(StreamError::StaleDataTimeout("request cancelled".to_string()));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(StreamError::StaleDataTimeout(format!(
                    "no camera frame within {:?}",
                    self.frame_timeout
                )));
            }
            if let Some(frame) = self
                .slot
                .pop_timeout(PopOrder::Newest, CANCEL_POLL.min(deadline - now))?
            {
                return Ok(frame);
            }
        }
    }

    /// Run `camera.capture_jpeg` in a loop, publishing every frame, until the
    /// run shuts down. A capture error ends the loop and closes the slot.
    pub fn start_capture(
        self: &Arc<Self>,
        camera: Arc<dyn CameraModule>,
        ctx: RunContext,
    ) -> std::io::Result<JoinHandle<()>> {
        let source = self.clone();
        std::thread::Builder::new()
            .name("camera-capture".to_string())
            .spawn(move || {
                log::debug!("Camera capture loop started");
                while !ctx.is_shutting_down() {
                    match camera.capture_jpeg() {
                        Ok(jpeg) => source.publish(Bytes::from(jpeg)),
                        Err(e) => {
                            if !ctx.is_shutting_down() {
                                log::error!("Camera capture failed: {}", e);
                                ctx.reporter().capture_error(&e);
                            }
                            break;
                        }
                    }
                }
                source.close();
                log::debug!("Camera capture loop ended");
            })
    }
}

impl FrameSource for CameraFrameSource {
    type Stream = CameraStream;

    fn boundary(&self) -> &str {
        CAMERA_BOUNDARY
    }

    fn snapshot(&self, cancel: &CancelToken) -> Result<Bytes> {
        let mut remaining = self.stale_retries + 1;
        loop {
            let frame = self.next_frame(cancel)?;
            let fresh = self
                .capture_gap()
                .map_or(true, |gap| gap >= self.stale_threshold);
            remaining -= 1;
            if fresh || remaining == 0 {
                return Ok(frame);
            }
            log::debug!("Discarding possibly stale frame, {} tries left", remaining);
        }
    }

    fn open_stream(&self) -> Result<CameraStream> {
        Ok(CameraStream::default())
    }

    fn next_chunk(&self, stream: &mut CameraStream, cancel: &CancelToken) -> Result<Option<Bytes>> {
        if stream.parts > 0 && !cancel.sleep(self.stream_interval) {
            return Ok(None);
        }
        let frame = match self.next_frame(cancel) {
            Ok(frame) => frame,
            Err(_) if cancel.is_cancelled() => return Ok(None),
            Err(e) => return Err(e),
        };
        stream.parts += 1;
        Ok(Some(multipart_part(CAMERA_BOUNDARY, &frame)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ServerConfig {
        ServerConfig {
            frame_timeout_ms: 300,
            stream_interval_ms: 10,
            ..ServerConfig::default()
        }
    }

    #[test]
    fn test_snapshot_of_quiet_slot_returns_first_frame() {
        let source = CameraFrameSource::new(&config());
        source.publish(Bytes::from_static(b"one"));
        std::thread::sleep(Duration::from_millis(150));
        let frame = source.snapshot(&CancelToken::new()).unwrap();
        assert_eq!(&frame[..], b"one");
    }

    #[test]
    fn test_snapshot_discards_rapid_frames() {
        let source = Arc::new(CameraFrameSource::new(&config()));
        let producer = {
            let source = source.clone();
            std::thread::spawn(move || {
                for i in 0..200u32 {
                    source.publish(Bytes::from(i.to_be_bytes().to_vec()));
                    std::thread::sleep(Duration::from_millis(5));
                }
            })
        };
        std::thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        let first = source.snapshot(&CancelToken::new()).unwrap();
        assert!(started.elapsed() < Duration::from_millis(300));
        // Three frames were pulled, so at least two publishes went by.
        let n = u32::from_be_bytes([first[0], first[1], first[2], first[3]]);
        assert!(n >= 2, "served frame {}", n);
        producer.join().unwrap();
    }

    #[test]
    fn test_snapshot_times_out_without_frames() {
        let source = CameraFrameSource::new(&config());
        let err = source.snapshot(&CancelToken::new()).unwrap_err();
        assert!(matches!(err, StreamError::StaleDataTimeout(_)));
    }

    #[test]
    fn test_closed_source_fails_fast() {
        let source = CameraFrameSource::new(&ServerConfig::default());
        source.close();
        let started = Instant::now();
        assert!(source.snapshot(&CancelToken::new()).is_err());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_stream_chunks_carry_part_headers() {
        let source = CameraFrameSource::new(&config());
        let cancel = CancelToken::new();
        let mut stream = source.open_stream().unwrap();

        source.publish(Bytes::from_static(b"\xFF\xD8\xFF\xD9"));
        let chunk = source.next_chunk(&mut stream, &cancel).unwrap().unwrap();
        assert!(chunk.starts_with(b"--herebedragons\r\nContent-Type: image/jpeg\r\n"));

        cancel.cancel();
        assert!(source.next_chunk(&mut stream, &cancel).unwrap().is_none());
    }
}
