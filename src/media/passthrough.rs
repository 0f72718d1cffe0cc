//! Proxy for a muxer helper that serves MJPEG on a local TCP port itself.

use crate::errors::{Result, StreamError};
use crate::media::{CancelToken, FrameSource};
use bytes::Bytes;
use std::io::{ErrorKind, Read};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

pub const PASSTHROUGH_BOUNDARY: &str = "spionisto";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const READ_SLICE: Duration = Duration::from_millis(200);
const HEADER_LIMIT: usize = 8 * 1024;
const CHUNK_SIZE: usize = 16 * 1024;

/// Relays the helper's multipart stream as-is; snapshots read one part.
#[derive(Debug, Clone)]
pub struct PassthroughFrameSource {
    addr: SocketAddr,
    max_bytes: usize,
    frame_timeout: Duration,
}

impl PassthroughFrameSource {
    pub fn new(addr: SocketAddr, max_bytes: usize, frame_timeout: Duration) -> Self {
        Self {
            addr,
            max_bytes,
            frame_timeout,
        }
    }

    fn timed_out(&self) -> StreamError {
        StreamError::StaleDataTimeout(format!(
            "no frame from muxer within {:?}",
            self.frame_timeout
        ))
    }

    fn connect(&self) -> Result<TcpStream> {
        let stream = TcpStream::connect_timeout(&self.addr, CONNECT_TIMEOUT)?;
        stream.set_read_timeout(Some(READ_SLICE))?;
        Ok(stream)
    }
}

/// Outcome of one cancellable read.
enum ReadOutcome {
    Data(usize),
    Eof,
    Cancelled,
    Expired,
}

fn read_some(
    stream: &mut TcpStream,
    buf: &mut [u8],
    cancel: &CancelToken,
    deadline: Option<Instant>,
) -> Result<ReadOutcome> {
    loop {
        if cancel.is_cancelled() {
            return Ok(ReadOutcome::Cancelled);
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Ok(ReadOutcome::Expired);
        }
        match stream.read(buf) {
            Ok(0) => return Ok(ReadOutcome::Eof),
            Ok(n) => return Ok(ReadOutcome::Data(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => continue,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Locate the first part's `Content-Length` and where its body begins.
pub fn parse_part_header(data: &[u8]) -> Option<(usize, usize)> {
    let header_end = find(data, b"\r\n\r\n")?;
    let header = std::str::from_utf8(&data[..header_end]).ok()?;
    let length = header.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse::<usize>().ok()
        } else {
            None
        }
    })?;
    Some((header_end + 4, length))
}

impl FrameSource for PassthroughFrameSource {
    type Stream = TcpStream;

    fn boundary(&self) -> &str {
        PASSTHROUGH_BOUNDARY
    }

    fn snapshot(&self, cancel: &CancelToken) -> Result<Bytes> {
        let deadline = Some(Instant::now() + self.frame_timeout);
        let mut stream = self.connect()?;
        let mut data = Vec::with_capacity(64 * 1024);
        let mut buf = vec![0u8; CHUNK_SIZE];

        let (body_start, length) = loop {
            if let Some(found) = parse_part_header(&data) {
                break found;
            }
            if data.len() > HEADER_LIMIT {
                return Err(StreamError::ProtocolViolation(
                    "no complete part header with Content-Length in muxer stream".to_string(),
                ));
            }
            match read_some(&mut stream, &mut buf, cancel, deadline)? {
                ReadOutcome::Data(n) => data.extend_from_slice(&buf[..n]),
                ReadOutcome::Expired => return Err(self.timed_out()),
                ReadOutcome::Eof | ReadOutcome::Cancelled => {
                    return Err(StreamError::StaleDataTimeout(
                        "muxer stream ended before a frame".to_string(),
                    ))
                }
            }
        };
        if length > self.max_bytes {
            return Err(StreamError::ProtocolViolation(format!(
                "frame of {} bytes exceeds limit",
                length
            )));
        }

        while data.len() < body_start + length {
            match read_some(&mut stream, &mut buf, cancel, deadline)? {
                ReadOutcome::Data(n) => data.extend_from_slice(&buf[..n]),
                ReadOutcome::Expired => return Err(self.timed_out()),
                ReadOutcome::Eof | ReadOutcome::Cancelled => {
                    return Err(StreamError::StaleDataTimeout(
                        "muxer stream ended mid-frame".to_string(),
                    ))
                }
            }
        }
        Ok(Bytes::from(data).slice(body_start..body_start + length))
    }

    fn open_stream(&self) -> Result<TcpStream> {
        self.connect()
    }

    fn next_chunk(&self, stream: &mut TcpStream, cancel: &CancelToken) -> Result<Option<Bytes>> {
        let mut buf = vec![0u8; CHUNK_SIZE];
        match read_some(stream, &mut buf, cancel, None)? {
            ReadOutcome::Data(n) => {
                buf.truncate(n);
                Ok(Some(Bytes::from(buf)))
            }
            ReadOutcome::Eof | ReadOutcome::Cancelled | ReadOutcome::Expired => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;

    #[test]
    fn test_parse_part_header() {
        let data = b"--spionisto\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\nabcdrest";
        let (start, len) = parse_part_header(data).unwrap();
        assert_eq!(len, 4);
        assert_eq!(&data[start..start + len], b"abcd");
        assert!(parse_part_header(b"--spionisto\r\nContent-Type").is_none());
    }

    #[test]
    fn test_snapshot_reads_one_part() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            conn.write_all(b"--spionisto\r\nContent-Type: image/jpeg\r\ncontent-length: 6\r\n\r\n\xFF\xD8")
                .unwrap();
            conn.flush().unwrap();
            std::thread::sleep(Duration::from_millis(50));
            conn.write_all(b"\xFF\x00\xFF\xD9\r\n--spionisto\r\n").unwrap();
        });

        let source = PassthroughFrameSource::new(addr, 1 << 20, Duration::from_secs(5));
        let jpeg = source.snapshot(&CancelToken::new()).unwrap();
        assert_eq!(&jpeg[..], b"\xFF\xD8\xFF\x00\xFF\xD9");
        server.join().unwrap();
    }

    #[test]
    fn test_snapshot_rejects_header_without_terminator() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let junk = vec![b'x'; 4 * 1024];
            // Stop as soon as the reader hangs up.
            for _ in 0..1024 {
                if conn.write_all(&junk).is_err() {
                    break;
                }
            }
        });

        let source = PassthroughFrameSource::new(addr, 1 << 20, Duration::from_secs(30));
        let start = Instant::now();
        let err = source.snapshot(&CancelToken::new()).unwrap_err();
        assert!(matches!(err, StreamError::ProtocolViolation(_)), "{}", err);
        assert!(start.elapsed() < Duration::from_secs(10));
        server.join().unwrap();
    }

    #[test]
    fn test_snapshot_times_out_on_silent_muxer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            conn.write_all(b"--spionisto\r\nContent-Type: image/jpeg\r\n").unwrap();
            let _ = done_rx.recv_timeout(Duration::from_secs(10));
        });

        let source = PassthroughFrameSource::new(addr, 1 << 20, Duration::from_millis(300));
        let start = Instant::now();
        let err = source.snapshot(&CancelToken::new()).unwrap_err();
        assert!(matches!(err, StreamError::StaleDataTimeout(_)), "{}", err);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(5), "{:?}", elapsed);

        done_tx.send(()).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_stream_relays_bytes_until_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            conn.write_all(b"hello").unwrap();
        });

        let source = PassthroughFrameSource::new(addr, 1 << 20, Duration::from_secs(5));
        let cancel = CancelToken::new();
        let mut stream = source.open_stream().unwrap();
        let mut received = Vec::new();
        while let Some(chunk) = source.next_chunk(&mut stream, &cancel).unwrap() {
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, b"hello");
        server.join().unwrap();
    }
}
