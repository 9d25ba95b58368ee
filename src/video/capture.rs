//! Capture loop
//!
//! Owns the capture device and the encoder, and publishes every frame it
//! manages to encode into the shared [`FrameBuffer`]. It never gives up on
//! the device:
//!
//! ```text
//!            open ok                  read+encode ok
//! Closed ──> Opening ─────────> Streaming <─────────┐
//!   ^          │  ^                 │ read/encode   │
//!   │          └──┘ open failed     v failed        │
//!   │             (open backoff)  Failing(n) ───────┘
//!   └──── n == threshold ───────────┘ (read retry)
//!         close, reopen delay
//! ```
//!
//! [`CaptureLoop::step`] performs a single transition and returns how long to
//! wait before the next one; [`CaptureLoop::run`] drives it on a blocking
//! thread until shutdown.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::device::CaptureDevice;
use super::encoder::FrameEncoder;
use crate::config::CaptureRetryConfig;
use crate::error::Result;
use crate::stream::FrameBuffer;
use crate::utils::LogThrottler;

/// Longest single sleep in [`CaptureLoop::run`], so shutdown is noticed promptly
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// Device not open
    Closed,
    /// Trying to open the device
    Opening,
    /// Device open, last read succeeded
    Streaming,
    /// Device open, this many consecutive reads have failed
    Failing(u32),
}

impl CaptureState {
    /// Consecutive failures in the current state (0 unless `Failing`)
    pub fn failures(&self) -> u32 {
        match self {
            CaptureState::Failing(n) => *n,
            _ => 0,
        }
    }
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureState::Closed => write!(f, "closed"),
            CaptureState::Opening => write!(f, "opening"),
            CaptureState::Streaming => write!(f, "streaming"),
            CaptureState::Failing(n) => write!(f, "failing({})", n),
        }
    }
}

/// Counters kept across reopens
#[derive(Debug, Clone, Default)]
pub struct CaptureStats {
    pub frames_captured: u64,
    pub read_failures: u64,
    pub open_failures: u64,
    pub reopens: u64,
    /// Measured over roughly the last second
    pub current_fps: f32,
}

pub struct CaptureLoop<D: CaptureDevice, E: FrameEncoder> {
    device: D,
    encoder: E,
    buffer: Arc<FrameBuffer>,
    policy: CaptureRetryConfig,
    state: CaptureState,
    state_tx: watch::Sender<CaptureState>,
    stats: Arc<Mutex<CaptureStats>>,
    throttler: LogThrottler,
    fps_window_start: Instant,
    fps_window_frames: u32,
}

impl<D: CaptureDevice, E: FrameEncoder> CaptureLoop<D, E> {
    pub fn new(device: D, encoder: E, buffer: Arc<FrameBuffer>, policy: CaptureRetryConfig) -> Self {
        let (state_tx, _) = watch::channel(CaptureState::Closed);
        Self {
            device,
            encoder,
            buffer,
            policy,
            state: CaptureState::Closed,
            state_tx,
            stats: Arc::new(Mutex::new(CaptureStats::default())),
            throttler: LogThrottler::default(),
            fps_window_start: Instant::now(),
            fps_window_frames: 0,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Observe state changes from other tasks
    pub fn state_watch(&self) -> watch::Receiver<CaptureState> {
        self.state_tx.subscribe()
    }

    pub fn stats_handle(&self) -> Arc<Mutex<CaptureStats>> {
        self.stats.clone()
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats.lock().clone()
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    fn set_state(&mut self, state: CaptureState) {
        if self.state != state {
            debug!("Capture state: {} -> {}", self.state, state);
            self.state = state;
            self.state_tx.send_replace(state);
        }
    }

    /// Perform one transition. Returns the delay before the next step, if any.
    pub fn step(&mut self) -> Option<Duration> {
        match self.state {
            CaptureState::Closed => {
                self.set_state(CaptureState::Opening);
                None
            }
            CaptureState::Opening => self.try_open(),
            CaptureState::Streaming | CaptureState::Failing(_) => self.try_capture(),
        }
    }

    fn try_open(&mut self) -> Option<Duration> {
        match self.device.open() {
            Ok(()) => {
                info!("Capture device {} opened", self.device.name());
                self.throttler.clear("open");
                self.set_state(CaptureState::Streaming);
                None
            }
            Err(e) => {
                self.stats.lock().open_failures += 1;
                let backoff = self.policy.open_backoff();
                if let Some(suppressed) = self.throttler.check("open") {
                    if suppressed > 0 {
                        warn!(
                            "Failed to open {}: {} (suppressed {} repeats), retrying every {:?}",
                            self.device.name(),
                            e,
                            suppressed,
                            backoff
                        );
                    } else {
                        warn!(
                            "Failed to open {}: {}, retrying every {:?}",
                            self.device.name(),
                            e,
                            backoff
                        );
                    }
                }
                Some(backoff)
            }
        }
    }

    fn capture_one(&mut self) -> Result<u64> {
        let raw = self.device.read_frame()?;
        let jpeg = self.encoder.encode(&raw)?;
        Ok(self
            .buffer
            .publish_captured(jpeg, raw.resolution, raw.capture_ts))
    }

    fn try_capture(&mut self) -> Option<Duration> {
        match self.capture_one() {
            Ok(sequence) => {
                if let CaptureState::Failing(n) = self.state {
                    info!("Capture recovered after {} failed reads", n);
                }
                self.record_frame();
                debug!("Published frame {}", sequence);
                self.set_state(CaptureState::Streaming);
                None
            }
            Err(e) => {
                let failures = self.state.failures() + 1;
                self.stats.lock().read_failures += 1;

                if failures >= self.policy.failure_threshold {
                    error!(
                        "{} consecutive capture failures on {} (last: {}), reopening",
                        failures,
                        self.device.name(),
                        e
                    );
                    self.device.close();
                    self.stats.lock().reopens += 1;
                    self.reset_fps();
                    self.set_state(CaptureState::Closed);
                    Some(self.policy.reopen_delay())
                } else {
                    warn!(
                        "{} failed on {} ({}/{}): {}",
                        if e.is_device_error() { "Read" } else { "Encode" },
                        self.device.name(),
                        failures,
                        self.policy.failure_threshold,
                        e
                    );
                    self.set_state(CaptureState::Failing(failures));
                    Some(self.policy.read_retry())
                }
            }
        }
    }

    fn record_frame(&mut self) {
        self.fps_window_frames += 1;
        let elapsed = self.fps_window_start.elapsed();

        let mut stats = self.stats.lock();
        stats.frames_captured += 1;
        if elapsed >= Duration::from_secs(1) {
            stats.current_fps = self.fps_window_frames as f32 / elapsed.as_secs_f32();
            drop(stats);
            self.reset_fps();
        }
    }

    fn reset_fps(&mut self) {
        self.fps_window_frames = 0;
        self.fps_window_start = Instant::now();
    }

    /// Drive the loop until `shutdown` is cancelled, then close the device.
    ///
    /// Blocks the calling thread; run it under `spawn_blocking`.
    pub fn run(mut self, shutdown: CancellationToken) {
        info!(
            "Capture loop started on {} with {}",
            self.device.name(),
            self.encoder.name()
        );

        while !shutdown.is_cancelled() {
            if let Some(delay) = self.step() {
                sleep_unless_cancelled(delay, &shutdown);
            }
        }

        self.device.close();
        self.set_state(CaptureState::Closed);
        info!(
            "Capture loop stopped after {} frames",
            self.stats.lock().frames_captured
        );
    }
}

fn sleep_unless_cancelled(delay: Duration, shutdown: &CancellationToken) {
    let deadline = Instant::now() + delay;
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep((deadline - now).min(SHUTDOWN_POLL));
    }
}
