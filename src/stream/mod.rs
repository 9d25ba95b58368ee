//! Frame distribution
//!
//! # Components
//!
//! - `FrameBuffer` - single-slot latest-frame store with publish notification
//! - `StreamSession` - per-client loop writing multipart parts to a `FrameSink`
//! - `ClientRegistry` / `ClientGuard` - connected client bookkeeping

pub mod buffer;
pub mod mjpeg;
pub mod session;

pub use buffer::{FrameBuffer, FrameSnapshot, WaitOutcome};
pub use mjpeg::{create_mjpeg_part, ClientGuard, ClientRegistry, ClientSession};
pub use session::{FrameSink, SinkClosed, StreamSession};
