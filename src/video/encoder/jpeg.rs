//! JPEG encoder
//!
//! MJPEG frames from the device are already JPEG and pass straight through
//! after a marker check. Everything else goes through the `image` crate's
//! baseline JPEG encoder:
//! ```text
//! YUYV/BGR24 ──convert──> RGB24 ──image::codecs::jpeg──> JPEG
//! RGB24/GREY ─────────────────────image::codecs::jpeg──> JPEG
//! ```

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder as ImageJpegEncoder;
use image::ExtendedColorType;

use super::traits::FrameEncoder;
use crate::error::{AppError, Result};
use crate::video::format::{PixelFormat, Resolution};
use crate::video::frame::{is_valid_jpeg, RawFrame};

pub struct JpegEncoder {
    quality: u8,
    /// Scratch buffer reused across frames that need conversion or unpadding
    scratch: Vec<u8>,
}

/// Row geometry of an uncompressed frame
#[derive(Debug, Clone, Copy)]
struct RowLayout {
    /// Pixel bytes per row
    row_bytes: usize,
    /// Bytes from one row start to the next (>= `row_bytes`)
    stride: usize,
    rows: usize,
}

impl RowLayout {
    fn of(frame: &RawFrame) -> Result<Self> {
        let resolution = frame.resolution;
        let row_bytes = frame
            .format
            .frame_size(Resolution::new(resolution.width, 1))
            .ok_or_else(|| AppError::Encode(format!("{} has no fixed frame size", frame.format)))?;
        if row_bytes == 0 || resolution.height == 0 {
            return Err(AppError::Encode(format!("empty {} frame", resolution)));
        }

        // A stride of 0 or below the row width means "packed"
        let stride = (frame.stride as usize).max(row_bytes);
        let rows = resolution.height as usize;
        let expected = stride * (rows - 1) + row_bytes;
        if frame.len() < expected {
            return Err(AppError::Encode(format!(
                "{} data too small: {} < {} (stride {})",
                frame.format,
                frame.len(),
                expected,
                stride
            )));
        }
        Ok(Self {
            row_bytes,
            stride,
            rows,
        })
    }

    fn is_packed(&self) -> bool {
        self.stride == self.row_bytes
    }

    fn rows<'a>(&self, data: &'a [u8]) -> impl Iterator<Item = &'a [u8]> {
        let row_bytes = self.row_bytes;
        data.chunks(self.stride)
            .take(self.rows)
            .map(move |row| &row[..row_bytes])
    }
}

impl JpegEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
            scratch: Vec::new(),
        }
    }

    /// Compress a frame whose pixels the codec takes as-is, dropping any row
    /// padding first
    fn compress_rows(&mut self, frame: &RawFrame, color: ExtendedColorType) -> Result<Bytes> {
        let layout = RowLayout::of(frame)?;
        if layout.is_packed() {
            let size = layout.row_bytes * layout.rows;
            return Self::compress(self.quality, &frame.data()[..size], frame.resolution, color);
        }

        self.scratch.clear();
        self.scratch.reserve(layout.row_bytes * layout.rows);
        for row in layout.rows(frame.data()) {
            self.scratch.extend_from_slice(row);
        }
        Self::compress(self.quality, &self.scratch, frame.resolution, color)
    }

    /// Convert row by row into RGB24, then compress
    fn convert_rows(
        &mut self,
        frame: &RawFrame,
        convert: fn(&[u8], &mut Vec<u8>),
    ) -> Result<Bytes> {
        let layout = RowLayout::of(frame)?;
        self.scratch.clear();
        self.scratch.reserve(frame.resolution.pixels() as usize * 3);
        for row in layout.rows(frame.data()) {
            convert(row, &mut self.scratch);
        }
        Self::compress(
            self.quality,
            &self.scratch,
            frame.resolution,
            ExtendedColorType::Rgb8,
        )
    }

    fn compress(
        quality: u8,
        pixels: &[u8],
        resolution: Resolution,
        color: ExtendedColorType,
    ) -> Result<Bytes> {
        let mut out = Vec::with_capacity(pixels.len() / 8);
        ImageJpegEncoder::new_with_quality(&mut out, quality)
            .encode(pixels, resolution.width, resolution.height, color)
            .map_err(|e| AppError::Encode(format!("JPEG compression failed: {}", e)))?;
        Ok(Bytes::from(out))
    }
}

impl FrameEncoder for JpegEncoder {
    fn name(&self) -> &str {
        "JPEG (image)"
    }

    fn quality(&self) -> u8 {
        self.quality
    }

    fn encode(&mut self, frame: &RawFrame) -> Result<Bytes> {
        match frame.format {
            PixelFormat::Mjpeg => {
                if !is_valid_jpeg(frame.data()) {
                    return Err(AppError::Encode(format!(
                        "corrupt MJPEG frame ({} bytes)",
                        frame.len()
                    )));
                }
                Ok(frame.data_bytes())
            }
            PixelFormat::Rgb24 => self.compress_rows(frame, ExtendedColorType::Rgb8),
            PixelFormat::Grey => self.compress_rows(frame, ExtendedColorType::L8),
            PixelFormat::Bgr24 => self.convert_rows(frame, bgr_to_rgb),
            PixelFormat::Yuyv => self.convert_rows(frame, yuyv_to_rgb),
        }
    }
}

/// Append `src` (BGR24) to `dst` as RGB24
fn bgr_to_rgb(src: &[u8], dst: &mut Vec<u8>) {
    for px in src.chunks_exact(3) {
        dst.extend_from_slice(&[px[2], px[1], px[0]]);
    }
}

/// Append `src` (BT.601 YUYV, Y0 U Y1 V) to `dst` as RGB24, 8.8 fixed point
fn yuyv_to_rgb(src: &[u8], dst: &mut Vec<u8>) {
    for quad in src.chunks_exact(4) {
        let u = quad[1] as i32 - 128;
        let v = quad[3] as i32 - 128;
        let r_off = (359 * v) >> 8;
        let g_off = (88 * u + 183 * v) >> 8;
        let b_off = (454 * u) >> 8;
        for y in [quad[0] as i32, quad[2] as i32] {
            dst.push((y + r_off).clamp(0, 255) as u8);
            dst.push((y - g_off).clamp(0, 255) as u8);
            dst.push((y + b_off).clamp(0, 255) as u8);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_dims(jpeg: &[u8]) -> (u32, u32) {
        let img = image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg).unwrap();
        (img.width(), img.height())
    }

    #[test]
    fn test_quality_is_clamped() {
        assert_eq!(JpegEncoder::new(0).quality(), 1);
        assert_eq!(JpegEncoder::new(200).quality(), 100);
        assert_eq!(JpegEncoder::new(70).quality(), 70);
    }

    #[test]
    fn test_encode_rgb() {
        let res = Resolution::new(32, 16);
        let frame = RawFrame::from_vec(vec![128u8; 32 * 16 * 3], res, PixelFormat::Rgb24);
        let jpeg = JpegEncoder::new(70).encode(&frame).unwrap();
        assert!(is_valid_jpeg(&jpeg));
        assert_eq!(decode_dims(&jpeg), (32, 16));
    }

    #[test]
    fn test_encode_yuyv_and_bgr() {
        let res = Resolution::new(16, 8);
        let mut encoder = JpegEncoder::new(80);

        let yuyv = RawFrame::from_vec(vec![0x80u8; 16 * 8 * 2], res, PixelFormat::Yuyv);
        let jpeg = encoder.encode(&yuyv).unwrap();
        assert_eq!(decode_dims(&jpeg), (16, 8));

        let bgr = RawFrame::from_vec(vec![10u8; 16 * 8 * 3], res, PixelFormat::Bgr24);
        let jpeg = encoder.encode(&bgr).unwrap();
        assert_eq!(decode_dims(&jpeg), (16, 8));
    }

    #[test]
    fn test_short_frame_rejected() {
        let frame = RawFrame::from_vec(vec![0u8; 10], Resolution::new(16, 8), PixelFormat::Rgb24);
        assert!(matches!(
            JpegEncoder::new(70).encode(&frame),
            Err(AppError::Encode(_))
        ));
    }

    #[test]
    fn test_mjpeg_passthrough() {
        let mut data = vec![0xFF, 0xD8];
        data.extend(vec![0x11u8; 300]);
        data.extend([0xFF, 0xD9]);
        let frame = RawFrame::from_vec(data.clone(), Resolution::VGA, PixelFormat::Mjpeg);
        let out = JpegEncoder::new(70).encode(&frame).unwrap();
        assert_eq!(&out[..], &data[..]);

        let corrupt = RawFrame::from_vec(vec![0u8; 300], Resolution::VGA, PixelFormat::Mjpeg);
        assert!(JpegEncoder::new(70).encode(&corrupt).is_err());
    }

    /// Copy a packed frame into rows of `stride` bytes, filling padding with junk
    fn pad_rows(packed: &[u8], row_bytes: usize, stride: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for row in packed.chunks(row_bytes) {
            out.extend_from_slice(row);
            out.resize(out.len() + stride - row_bytes, 0xEE);
        }
        out
    }

    #[test]
    fn test_padded_rows_encode_like_packed() {
        let res = Resolution::new(16, 8);
        let mut encoder = JpegEncoder::new(80);

        // Gradient so a misaligned row would change the output
        let yuyv: Vec<u8> = (0..16 * 8 * 2).map(|i| (i * 7 % 251) as u8).collect();
        let packed = RawFrame::from_vec(yuyv.clone(), res, PixelFormat::Yuyv);
        let padded = RawFrame::new(
            Bytes::from(pad_rows(&yuyv, 32, 40)),
            res,
            PixelFormat::Yuyv,
            40,
        );
        assert_eq!(
            encoder.encode(&packed).unwrap(),
            encoder.encode(&padded).unwrap()
        );

        let rgb: Vec<u8> = (0..16 * 8 * 3).map(|i| (i * 13 % 253) as u8).collect();
        let packed = RawFrame::from_vec(rgb.clone(), res, PixelFormat::Rgb24);
        let padded = RawFrame::new(
            Bytes::from(pad_rows(&rgb, 48, 64)),
            res,
            PixelFormat::Rgb24,
            64,
        );
        assert_eq!(
            encoder.encode(&packed).unwrap(),
            encoder.encode(&padded).unwrap()
        );
    }

    #[test]
    fn test_last_row_needs_no_padding() {
        // 7 padded rows plus one bare row is enough data
        let res = Resolution::new(16, 8);
        let data = vec![0x80u8; 40 * 7 + 32];
        let frame = RawFrame::new(Bytes::from(data), res, PixelFormat::Yuyv, 40);
        let jpeg = JpegEncoder::new(70).encode(&frame).unwrap();
        assert_eq!(decode_dims(&jpeg), (16, 8));
    }

    #[test]
    fn test_short_strided_frame_rejected() {
        // Enough bytes for a packed frame, not for the declared stride
        let res = Resolution::new(16, 8);
        let frame = RawFrame::new(
            Bytes::from(vec![0x80u8; 16 * 8 * 2]),
            res,
            PixelFormat::Yuyv,
            40,
        );
        assert!(matches!(
            JpegEncoder::new(70).encode(&frame),
            Err(AppError::Encode(_))
        ));
    }

    #[test]
    fn test_yuyv_grey_maps_to_grey() {
        let mut rgb = Vec::new();
        yuyv_to_rgb(&[100, 128, 200, 128], &mut rgb);
        assert_eq!(rgb, vec![100, 100, 100, 200, 200, 200]);

        // Converters append so rows can be fed one at a time
        yuyv_to_rgb(&[50, 128, 60, 128], &mut rgb);
        assert_eq!(&rgb[6..], &[50, 50, 50, 60, 60, 60]);
    }
}
