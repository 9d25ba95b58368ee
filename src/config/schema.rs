use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{AppError, Result};

/// Largest accepted frame width or height
pub const MAX_DIMENSION: u32 = 8192;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Web server settings
    pub web: WebConfig,
    /// Video capture settings
    pub video: VideoConfig,
    /// Capture retry policy
    pub capture: CaptureRetryConfig,
    /// Stream session settings
    pub stream: StreamConfig,
}

impl AppConfig {
    /// Check ranges and normalise values that have a sensible clamp.
    pub fn validate(mut self) -> Result<Self> {
        if self.video.width == 0 || self.video.height == 0 {
            return Err(AppError::Config(format!(
                "Invalid frame dimensions {}x{}",
                self.video.width, self.video.height
            )));
        }
        if self.video.width > MAX_DIMENSION || self.video.height > MAX_DIMENSION {
            return Err(AppError::Config(format!(
                "Frame dimensions {}x{} exceed {}x{}",
                self.video.width, self.video.height, MAX_DIMENSION, MAX_DIMENSION
            )));
        }
        if self.video.fps == 0 {
            return Err(AppError::Config("Target FPS must be > 0".to_string()));
        }
        if self.capture.failure_threshold == 0 {
            return Err(AppError::Config(
                "Capture failure threshold must be >= 1".to_string(),
            ));
        }
        if self.stream.session_poll_ms == 0 {
            return Err(AppError::Config(
                "Session poll interval must be > 0".to_string(),
            ));
        }
        self.video.quality = self.video.quality.clamp(1, 100);
        Ok(self)
    }
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    /// Interface to listen on
    pub bind_address: String,
    /// TCP port
    pub http_port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: 8080,
        }
    }
}

/// Where frames come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// V4L2 / UVC webcam (`/dev/video{index}`)
    V4l2,
    /// Synthetic moving colour bars
    TestPattern,
}

impl Default for SourceKind {
    fn default() -> Self {
        if cfg!(feature = "v4l2") {
            SourceKind::V4l2
        } else {
            SourceKind::TestPattern
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::V4l2 => write!(f, "v4l2"),
            SourceKind::TestPattern => write!(f, "test-pattern"),
        }
    }
}

/// Video capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    /// Frame source
    pub source: SourceKind,
    /// Capture device index (`/dev/video{index}`)
    pub camera_index: u32,
    /// Requested width
    pub width: u32,
    /// Requested height
    pub height: u32,
    /// Frames per second requested from the device
    pub fps: u32,
    /// JPEG quality (1-100)
    pub quality: u8,
    /// Make every Nth read of the test-pattern source fail (0 = never)
    pub inject_read_failure_every: u64,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::default(),
            camera_index: 1,
            width: 640,
            height: 480,
            fps: 25,
            quality: 70,
            inject_read_failure_every: 0,
        }
    }
}

/// Capture loop retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureRetryConfig {
    /// Consecutive read failures before the device is closed and reopened
    pub failure_threshold: u32,
    /// Delay between failed open attempts
    pub open_backoff_ms: u64,
    /// Delay after closing an exhausted device, before reopening
    pub reopen_delay_ms: u64,
    /// Delay before retrying a failed read on an open device
    pub read_retry_ms: u64,
}

impl Default for CaptureRetryConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_backoff_ms: 2000,
            reopen_delay_ms: 1000,
            read_retry_ms: 200,
        }
    }
}

impl CaptureRetryConfig {
    pub fn open_backoff(&self) -> Duration {
        Duration::from_millis(self.open_backoff_ms)
    }

    pub fn reopen_delay(&self) -> Duration {
        Duration::from_millis(self.reopen_delay_ms)
    }

    pub fn read_retry(&self) -> Duration {
        Duration::from_millis(self.read_retry_ms)
    }
}

/// Stream session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Upper bound on how long a session waits for a frame before re-checking its client
    pub session_poll_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            session_poll_ms: 1000,
        }
    }
}

impl StreamConfig {
    pub fn session_poll(&self) -> Duration {
        Duration::from_millis(self.session_poll_ms)
    }
}
