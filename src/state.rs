use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::stream::{ClientRegistry, FrameBuffer};
use crate::video::{CaptureState, CaptureStats};

/// Application-wide state shared across handlers
///
/// The capture loop owns the device; handlers only ever see the frame buffer
/// and read-only views of the loop's state and counters.
pub struct AppState {
    /// Validated configuration (immutable after startup)
    pub config: AppConfig,
    /// Latest encoded frame
    pub frames: Arc<FrameBuffer>,
    /// Connected `/stream` clients
    pub clients: Arc<ClientRegistry>,
    /// Capture loop state as last reported
    pub capture_state: watch::Receiver<CaptureState>,
    /// Capture loop counters
    pub capture_stats: Arc<Mutex<CaptureStats>>,
    /// Cancelled when the server is shutting down; ends open streams
    pub shutdown: CancellationToken,
    started_at: Instant,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        frames: Arc<FrameBuffer>,
        capture_state: watch::Receiver<CaptureState>,
        capture_stats: Arc<Mutex<CaptureStats>>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            frames,
            clients: Arc::new(ClientRegistry::new()),
            capture_state,
            capture_stats,
            shutdown,
            started_at: Instant::now(),
        })
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
