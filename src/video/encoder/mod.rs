//! Frame encoders
//!
//! Turns raw device frames into the JPEG payloads published to clients.

pub mod jpeg;
pub mod traits;

pub use jpeg::JpegEncoder;
pub use traits::FrameEncoder;
