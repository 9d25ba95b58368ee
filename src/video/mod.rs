//! Video capture and encoding
//!
//! Device adapters produce raw frames, the JPEG encoder compresses them and
//! the capture loop publishes the result.

pub mod capture;
pub mod device;
pub mod encoder;
pub mod format;
pub mod frame;
pub mod test_pattern;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use capture::{CaptureLoop, CaptureState, CaptureStats};
pub use device::{create_device, CaptureDevice, DeviceSettings};
pub use encoder::{FrameEncoder, JpegEncoder};
pub use format::{PixelFormat, Resolution};
pub use frame::{EncodedFrame, RawFrame};
pub use test_pattern::TestPatternDevice;
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Device;
