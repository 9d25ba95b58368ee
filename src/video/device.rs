//! Capture device abstraction
//!
//! The capture loop only ever talks to a device through [`CaptureDevice`]:
//! open, read the next raw frame, close. Implementations do blocking I/O and
//! are driven from a dedicated blocking thread.

use tracing::{info, warn};

use super::format::Resolution;
use super::frame::RawFrame;
use super::test_pattern::TestPatternDevice;
use crate::config::{SourceKind, VideoConfig};
use crate::error::Result;

/// What the capture loop asks of a device when opening it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSettings {
    /// Device index (`/dev/video{index}` for V4L2)
    pub index: u32,
    pub resolution: Resolution,
    pub fps: u32,
}

impl From<&VideoConfig> for DeviceSettings {
    fn from(config: &VideoConfig) -> Self {
        Self {
            index: config.camera_index,
            resolution: Resolution::new(config.width, config.height),
            fps: config.fps,
        }
    }
}

/// A source of raw frames that can be opened, read and closed repeatedly
pub trait CaptureDevice: Send {
    /// Human-readable identifier used in logs (e.g. `/dev/video1`)
    fn name(&self) -> String;

    /// Open (or reopen) the device. Calling `open` on an open device reopens it.
    fn open(&mut self) -> Result<()>;

    /// Block until the next frame is available, or fail
    fn read_frame(&mut self) -> Result<RawFrame>;

    /// Release the device. Must be safe to call on a closed device.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

impl<T: CaptureDevice + ?Sized> CaptureDevice for Box<T> {
    fn name(&self) -> String {
        (**self).name()
    }

    fn open(&mut self) -> Result<()> {
        (**self).open()
    }

    fn read_frame(&mut self) -> Result<RawFrame> {
        (**self).read_frame()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }
}

/// Build the configured device. The device is returned closed; the capture
/// loop opens it.
pub fn create_device(config: &VideoConfig) -> Result<Box<dyn CaptureDevice>> {
    let settings = DeviceSettings::from(config);
    info!(
        "Using {} source (index {}, {} @ {}fps)",
        config.source, settings.index, settings.resolution, settings.fps
    );

    let fail_every = config.inject_read_failure_every;
    if fail_every > 0 && config.source != SourceKind::TestPattern {
        warn!("Read failure injection only applies to the test-pattern source, ignoring");
    }

    match config.source {
        SourceKind::TestPattern => {
            let device = TestPatternDevice::new(settings);
            if fail_every > 0 {
                info!("Injecting a read failure every {} frames", fail_every);
                Ok(Box::new(device.with_read_failure_every(fail_every)))
            } else {
                Ok(Box::new(device))
            }
        }
        #[cfg(feature = "v4l2")]
        SourceKind::V4l2 => Ok(Box::new(super::v4l2::V4l2Device::new(settings))),
        #[cfg(not(feature = "v4l2"))]
        SourceKind::V4l2 => Err(crate::error::AppError::Config(
            "V4L2 support not compiled in (rebuild with --features v4l2)".to_string(),
        )),
    }
}
