//! Latest-frame buffer shared by the capture loop and every stream session
//!
//! Holds exactly one frame: whatever was published last. There is no queue.
//! A slow reader never holds anything up, it just sees a later frame next
//! time it looks.
//!
//! - Reads are lock-free (`ArcSwap` snapshot), so a reader always gets a
//!   complete frame or nothing.
//! - Publishes are serialised by a mutex so that sequence numbers are handed
//!   out in the same order frames become visible.
//! - A `watch` channel carries the latest sequence number, so waiters wake on
//!   publish instead of polling.

use arc_swap::ArcSwap;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::video::format::Resolution;
use crate::video::frame::EncodedFrame;

/// Point-in-time view of the buffer
#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    pub frame: Option<EncodedFrame>,
    /// Frames published so far (== `frame.sequence` when a frame exists)
    pub sequence: u64,
}

impl FrameSnapshot {
    /// True once at least one frame has been published
    pub fn ready(&self) -> bool {
        self.frame.is_some()
    }
}

/// Result of [`FrameBuffer::wait_for_next`]
#[derive(Debug, Clone)]
pub enum WaitOutcome {
    /// A frame newer than the one asked about
    Frame(EncodedFrame),
    /// Nothing newer arrived before the timeout
    TimedOut,
}

pub struct FrameBuffer {
    latest: ArcSwap<Option<EncodedFrame>>,
    publish_lock: Mutex<()>,
    sequence_tx: watch::Sender<u64>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        let (sequence_tx, _) = watch::channel(0);
        Self {
            latest: ArcSwap::from_pointee(None),
            publish_lock: Mutex::new(()),
            sequence_tx,
        }
    }

    /// Publish a new latest frame captured now. Returns its sequence number.
    pub fn publish(&self, data: Bytes, resolution: Resolution) -> u64 {
        self.publish_captured(data, resolution, Instant::now())
    }

    /// Publish a new latest frame, keeping the instant the raw frame was captured
    pub fn publish_captured(&self, data: Bytes, resolution: Resolution, capture_ts: Instant) -> u64 {
        let _guard = self.publish_lock.lock();

        let sequence = self.sequence() + 1;
        self.latest.store(Arc::new(Some(EncodedFrame::new(
            data, sequence, resolution, capture_ts,
        ))));
        // Wake waiters only after the frame is visible
        self.sequence_tx.send_replace(sequence);

        sequence
    }

    /// Current frame and sequence. Never blocks.
    pub fn read_latest(&self) -> FrameSnapshot {
        let frame = (**self.latest.load()).clone();
        let sequence = frame.as_ref().map(|f| f.sequence).unwrap_or(0);
        FrameSnapshot { frame, sequence }
    }

    pub fn latest(&self) -> Option<EncodedFrame> {
        (**self.latest.load()).clone()
    }

    /// Number of frames published so far
    pub fn sequence(&self) -> u64 {
        match &**self.latest.load() {
            Some(frame) => frame.sequence,
            None => 0,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.latest.load().is_some()
    }

    /// Wait until a frame with `sequence > since` exists, or `timeout` elapses.
    ///
    /// Returns at once if such a frame is already there. Pass `since = 0` to
    /// get the current frame, or the first one ever published if none exists yet.
    pub async fn wait_for_next(&self, since: u64, timeout: Duration) -> WaitOutcome {
        if tokio::time::timeout(timeout, self.published_after(since))
            .await
            .is_err()
        {
            return WaitOutcome::TimedOut;
        }

        match self.latest() {
            Some(frame) if frame.sequence > since => WaitOutcome::Frame(frame),
            _ => WaitOutcome::TimedOut,
        }
    }

    /// Resolve once a frame with `sequence > since` has been published. No timeout.
    pub async fn published_after(&self, since: u64) {
        let mut rx = self.sequence_tx.subscribe();
        // Only fails once the sender is gone, which cannot happen while `self` lives
        if rx.wait_for(|seq| *seq > since).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
