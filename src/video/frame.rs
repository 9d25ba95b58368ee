//! Frame data structures
//!
//! [`RawFrame`] is what a capture device hands to the capture loop;
//! [`EncodedFrame`] is what the capture loop publishes after encoding.

use bytes::Bytes;
use std::time::{Duration, Instant};

use super::format::{PixelFormat, Resolution};

/// An uncompressed (or device-compressed MJPEG) frame straight from a device
#[derive(Debug, Clone)]
pub struct RawFrame {
    data: Bytes,
    pub resolution: Resolution,
    pub format: PixelFormat,
    /// Bytes per line (0 when not meaningful, e.g. MJPEG)
    pub stride: u32,
    pub capture_ts: Instant,
}

impl RawFrame {
    pub fn new(data: Bytes, resolution: Resolution, format: PixelFormat, stride: u32) -> Self {
        Self {
            data,
            resolution,
            format,
            stride,
            capture_ts: Instant::now(),
        }
    }

    pub fn from_vec(data: Vec<u8>, resolution: Resolution, format: PixelFormat) -> Self {
        let stride = format
            .frame_size(resolution)
            .map(|size| (size / resolution.height.max(1) as usize) as u32)
            .unwrap_or(0);
        Self::new(Bytes::from(data), resolution, format, stride)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Frame data as Bytes (cheap clone)
    pub fn data_bytes(&self) -> Bytes {
        self.data.clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A compressed JPEG frame as published to the frame buffer.
///
/// The payload is immutable; cloning only bumps a refcount, so sessions can
/// hold one for the duration of a write without copying.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    data: Bytes,
    /// Publish order, starting at 1
    pub sequence: u64,
    pub resolution: Resolution,
    pub capture_ts: Instant,
}

impl EncodedFrame {
    pub fn new(data: Bytes, sequence: u64, resolution: Resolution, capture_ts: Instant) -> Self {
        Self {
            data,
            sequence,
            resolution,
            capture_ts,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_bytes(&self) -> Bytes {
        self.data.clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Time since the underlying raw frame was captured
    pub fn age(&self) -> Duration {
        self.capture_ts.elapsed()
    }
}

/// Check SOI/EOI markers of a JPEG buffer.
///
/// Some UVC devices pad MJPEG frames after the EOI marker, so a trailing
/// `D9 00` or `00 00` is also accepted.
pub fn is_valid_jpeg(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }
    if data[0] != 0xFF || data[1] != 0xD8 {
        return false;
    }
    let end = data.len();
    let end_marker = ((data[end - 2] as u16) << 8) | data[end - 1] as u16;
    matches!(end_marker, 0xFFD9 | 0xD900 | 0x0000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_jpeg() {
        let mut data = vec![0xFF, 0xD8];
        data.extend(vec![0x42u8; 200]);
        data.extend([0xFF, 0xD9]);
        assert!(is_valid_jpeg(&data));

        // Padded after EOI
        let mut padded = data.clone();
        padded.extend([0x00, 0x00]);
        assert!(is_valid_jpeg(&padded));

        // Wrong SOI
        let mut bad = vec![0x00, 0x00];
        bad.extend(vec![0x42u8; 200]);
        bad.extend([0xFF, 0xD9]);
        assert!(!is_valid_jpeg(&bad));

        // Truncated
        assert!(!is_valid_jpeg(&[0xFF, 0xD8]));
        assert!(!is_valid_jpeg(&[0xFF, 0xD8, 0x12, 0x34]));
    }

    #[test]
    fn test_raw_frame_stride() {
        let frame = RawFrame::from_vec(vec![0u8; 640 * 480 * 3], Resolution::VGA, PixelFormat::Rgb24);
        assert_eq!(frame.stride, 640 * 3);
        assert_eq!(frame.len(), 640 * 480 * 3);

        let jpeg = RawFrame::from_vec(vec![0xFF, 0xD8, 0xFF, 0xD9], Resolution::VGA, PixelFormat::Mjpeg);
        assert_eq!(jpeg.stride, 0);
    }

    #[test]
    fn test_encoded_frame_clone_shares_data() {
        let frame = EncodedFrame::new(
            Bytes::from_static(b"\xFF\xD8jpeg\xFF\xD9"),
            7,
            Resolution::VGA,
            Instant::now(),
        );
        let copy = frame.clone();
        assert_eq!(copy.sequence, 7);
        assert_eq!(copy.data().as_ptr(), frame.data().as_ptr());
    }
}
