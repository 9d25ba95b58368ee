//! Encoder trait

use bytes::Bytes;

use crate::error::Result;
use crate::video::frame::RawFrame;

/// Raw frame → compressed image bytes.
///
/// Quality is fixed when the encoder is built; encoders are owned by the
/// capture loop and never shared, hence `&mut self`.
pub trait FrameEncoder: Send {
    fn name(&self) -> &str;

    /// Quality passed to the codec (1-100)
    fn quality(&self) -> u8;

    fn encode(&mut self, frame: &RawFrame) -> Result<Bytes>;
}

impl<T: FrameEncoder + ?Sized> FrameEncoder for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn quality(&self) -> u8 {
        (**self).quality()
    }

    fn encode(&mut self, frame: &RawFrame) -> Result<Bytes> {
        (**self).encode(frame)
    }
}
