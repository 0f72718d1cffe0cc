//! Generated JPEG frames for offline tests.

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

/// Encode a gradient test pattern as a baseline JPEG.
///
/// The pattern shifts with `frame_number`, so consecutive frames differ.
pub fn synthetic_frame(frame_number: u64, width: u32, height: u32) -> Vec<u8> {
    let mut data = vec![0u8; (width * height * 3) as usize];

    let base = (frame_number % 256) as u8;
    for y in 0..height {
        for x in 0..width {
            let idx = ((y * width + x) * 3) as usize;
            data[idx] = base.wrapping_add((x % 256) as u8);
            data[idx + 1] = base.wrapping_add((y % 256) as u8);
            data[idx + 2] = base.wrapping_add(((x + y) % 256) as u8);
        }
    }

    let mut jpeg = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, 80);
    if let Err(e) = encoder.encode(&data, width, height, ExtendedColorType::Rgb8) {
        log::error!("Synthetic JPEG encoding failed: {}", e);
    }
    jpeg
}

/// A single synthetic JPEG of the given size.
pub fn synthetic_jpeg(width: u32, height: u32) -> Vec<u8> {
    synthetic_frame(0, width, height)
}
