//! JPEG framing helpers shared by the frame sources.

use crate::errors::{Result, StreamError};
use bytes::{BufMut, Bytes, BytesMut};

/// Start-of-image marker followed by the first segment marker byte.
pub const SOI: [u8; 3] = [0xFF, 0xD8, 0xFF];
/// End-of-image marker.
pub const EOI: [u8; 2] = [0xFF, 0xD9];

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Slice one JPEG image out of a buffered multipart entry.
///
/// The image runs from the first SOI marker through the first EOI after it;
/// without an EOI the remainder of the buffer is returned.
pub fn extract_jpeg(data: &Bytes) -> Result<Bytes> {
    let start = find(data, &SOI)
        .ok_or_else(|| StreamError::ProtocolViolation("JPEG start marker not found".to_string()))?;
    let end = find(&data[start..], &EOI)
        .map(|offset| start + offset + EOI.len())
        .unwrap_or(data.len());
    Ok(data.slice(start..end))
}

/// One multipart part: boundary line, headers and image, terminated by CRLF.
pub fn multipart_part(boundary: &str, jpeg: &[u8]) -> Bytes {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        boundary,
        jpeg.len()
    );
    let mut part = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
    part.put_slice(header.as_bytes());
    part.put_slice(jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

/// Pixel dimensions of an encoded image.
pub fn image_dimensions(data: &[u8]) -> Result<(u32, u32)> {
    let reader = image::ImageReader::new(std::io::Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| StreamError::ProtocolViolation(format!("unreadable image: {}", e)))?;
    reader
        .into_dimensions()
        .map_err(|e| StreamError::ProtocolViolation(format!("unreadable image: {}", e)))
}
