//! mjpeg-relay - camera to HTTP MJPEG relay
//!
//! One capture loop keeps a camera open and publishes the latest JPEG into a
//! shared frame buffer; every connected HTTP client is served from that
//! buffer at its own pace.

pub mod config;
pub mod error;
pub mod state;
pub mod stream;
pub mod utils;
pub mod video;
pub mod web;

pub use error::{AppError, Result};
