//! V4L2 webcam capture using the `v4l` crate (mmap streaming I/O)

use std::io;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::io::mmap::Stream as MmapStream;
use v4l::io::traits::CaptureStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::device::{CaptureDevice, DeviceSettings};
use super::format::{PixelFormat, Resolution};
use super::frame::RawFrame;
use crate::error::{AppError, Result};

/// Two buffers keep latency low: the driver fills one while we read the other
const BUFFER_COUNT: u32 = 2;
/// A read that takes longer than this counts as a failed read
const READ_TIMEOUT: Duration = Duration::from_secs(2);
/// Anything smaller is a truncated transfer, not a frame
const MIN_FRAME_SIZE: usize = 128;

struct OpenStream {
    stream: MmapStream<'static>,
    _device: Device,
    resolution: Resolution,
    format: PixelFormat,
    stride: u32,
}

/// `/dev/video{index}` capture device
pub struct V4l2Device {
    settings: DeviceSettings,
    current: Option<OpenStream>,
}

impl V4l2Device {
    pub fn new(settings: DeviceSettings) -> Self {
        Self {
            settings,
            current: None,
        }
    }

    fn open_error(&self, reason: impl ToString) -> AppError {
        AppError::DeviceOpen {
            device: self.name(),
            reason: reason.to_string(),
        }
    }

    fn open_stream(&self) -> Result<OpenStream> {
        let device =
            Device::new(self.settings.index as usize).map_err(|e| self.open_error(e))?;

        // Prefer MJPEG: the camera compresses for us and we just pass frames through.
        let mut negotiated = None;
        for format in [PixelFormat::Mjpeg, PixelFormat::Yuyv] {
            let mut fmt = device.format().map_err(|e| self.open_error(e))?;
            fmt.width = self.settings.resolution.width;
            fmt.height = self.settings.resolution.height;
            fmt.fourcc = FourCC::new(&format.fourcc());

            let actual = device.set_format(&fmt).map_err(|e| self.open_error(e))?;
            match PixelFormat::from_fourcc(&actual.fourcc.repr) {
                Some(got) if got == format => {
                    negotiated = Some((got, actual));
                    break;
                }
                other => debug!("Device rejected {}, got {:?}", format, other),
            }
        }

        let (format, actual) = negotiated.ok_or_else(|| {
            self.open_error("device supports neither MJPEG nor YUYV")
        })?;

        if let Err(e) = device.set_params(&Parameters::with_fps(self.settings.fps)) {
            warn!("Failed to set {}fps on {}: {}", self.settings.fps, self.name(), e);
        }

        let mut stream = MmapStream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT)
            .map_err(|e| self.open_error(e))?;
        stream.set_timeout(READ_TIMEOUT);

        let resolution = Resolution::new(actual.width, actual.height);
        info!(
            "Opened {} at {} {} @ {}fps",
            self.name(),
            resolution,
            format,
            self.settings.fps
        );

        Ok(OpenStream {
            stream,
            _device: device,
            resolution,
            format,
            stride: actual.stride,
        })
    }
}

impl CaptureDevice for V4l2Device {
    fn name(&self) -> String {
        format!("/dev/video{}", self.settings.index)
    }

    fn open(&mut self) -> Result<()> {
        self.close();
        self.current = Some(self.open_stream()?);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<RawFrame> {
        let open = self
            .current
            .as_mut()
            .ok_or_else(|| AppError::DeviceRead("device not open".to_string()))?;

        let (buf, meta) = open.stream.next().map_err(|e| {
            AppError::DeviceRead(match e.kind() {
                io::ErrorKind::TimedOut => "timed out waiting for frame".to_string(),
                _ => e.to_string(),
            })
        })?;

        let used = (meta.bytesused as usize).min(buf.len());
        if used < MIN_FRAME_SIZE {
            return Err(AppError::DeviceRead(format!(
                "short frame ({} bytes)",
                used
            )));
        }

        Ok(RawFrame::new(
            Bytes::copy_from_slice(&buf[..used]),
            open.resolution,
            open.format,
            open.stride,
        ))
    }

    fn close(&mut self) {
        if self.current.take().is_some() {
            info!("Closed {}", self.name());
        }
    }

    fn is_open(&self) -> bool {
        self.current.is_some()
    }
}
