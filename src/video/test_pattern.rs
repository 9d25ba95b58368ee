//! Synthetic frame source
//!
//! Produces RGB24 colour bars that scroll one step per frame, paced to the
//! requested frame rate. Lets the service (and its clients) run without any
//! camera attached.

use std::time::{Duration, Instant};

use super::device::{CaptureDevice, DeviceSettings};
use super::format::PixelFormat;
use super::frame::RawFrame;
use crate::error::{AppError, Result};

const BARS: [[u8; 3]; 8] = [
    [255, 255, 255],
    [255, 255, 0],
    [0, 255, 255],
    [0, 255, 0],
    [255, 0, 255],
    [255, 0, 0],
    [0, 0, 255],
    [0, 0, 0],
];

/// Colour-bar generator implementing [`CaptureDevice`]
pub struct TestPatternDevice {
    settings: DeviceSettings,
    open: bool,
    frame_count: u64,
    next_deadline: Option<Instant>,
    /// Fail every Nth read (0 = never)
    fail_every: u64,
}

impl TestPatternDevice {
    pub fn new(settings: DeviceSettings) -> Self {
        Self {
            settings,
            open: false,
            frame_count: 0,
            next_deadline: None,
            fail_every: 0,
        }
    }

    /// Make every `n`th read fail, to exercise the capture loop's recovery path
    pub fn with_read_failure_every(mut self, n: u64) -> Self {
        self.fail_every = n;
        self
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.settings.fps.max(1) as f64)
    }

    /// Sleep until the next frame slot so output is paced like a real camera
    fn pace(&mut self) {
        let interval = self.frame_interval();
        let now = Instant::now();
        let deadline = self.next_deadline.unwrap_or(now);
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
        // Don't try to catch up after a stall
        self.next_deadline = Some(deadline.max(now) + interval);
    }

    fn render(&self) -> Vec<u8> {
        let width = self.settings.resolution.width as usize;
        let height = self.settings.resolution.height as usize;
        let bar_width = (width / BARS.len()).max(1);
        let offset = (self.frame_count as usize * 4) % width.max(1);

        let mut data = Vec::with_capacity(width * height * 3);
        for _ in 0..height {
            for x in 0..width {
                let bar = ((x + offset) / bar_width) % BARS.len();
                data.extend_from_slice(&BARS[bar]);
            }
        }
        data
    }
}

impl CaptureDevice for TestPatternDevice {
    fn name(&self) -> String {
        format!("test-pattern:{}", self.settings.index)
    }

    fn open(&mut self) -> Result<()> {
        self.open = true;
        self.next_deadline = None;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<RawFrame> {
        if !self.open {
            return Err(AppError::DeviceRead("device not open".to_string()));
        }

        self.pace();
        self.frame_count += 1;

        if self.fail_every > 0 && self.frame_count % self.fail_every == 0 {
            return Err(AppError::DeviceRead(format!(
                "injected failure at frame {}",
                self.frame_count
            )));
        }

        Ok(RawFrame::from_vec(
            self.render(),
            self.settings.resolution,
            PixelFormat::Rgb24,
        ))
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
