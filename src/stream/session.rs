//! Per-client delivery loop
//!
//! A [`StreamSession`] waits on the shared [`FrameBuffer`] for anything newer
//! than what it last sent, frames it as one multipart part and hands it to a
//! [`FrameSink`]. It keeps going until the sink reports the client gone or
//! the server shuts down.
//!
//! A write that is still pending when a newer frame is published is dropped,
//! and the session moves on to the newest frame, so a slow client is at most
//! one frame behind what it has already accepted.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::buffer::{FrameBuffer, WaitOutcome};
use super::mjpeg::{create_mjpeg_part, ClientGuard};

/// The client side of a session went away
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("client disconnected")]
pub struct SinkClosed;

/// Where a session writes its chunks
///
/// A write either hands over the whole chunk or fails; a failed write ends
/// the session.
#[async_trait]
pub trait FrameSink: Send {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), SinkClosed>;

    /// Cheap liveness check, used when a wait times out
    fn is_closed(&self) -> bool;
}

/// The HTTP handler feeds the response body from a bounded channel
#[async_trait]
impl FrameSink for mpsc::Sender<Bytes> {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), SinkClosed> {
        self.send(chunk).await.map_err(|_| SinkClosed)
    }

    fn is_closed(&self) -> bool {
        mpsc::Sender::is_closed(self)
    }
}

pub struct StreamSession {
    buffer: Arc<FrameBuffer>,
    /// Sequence of the last frame written, 0 before the first
    last_sent: u64,
    /// Longest a single wait may block before liveness is re-checked
    poll: Duration,
    frames_sent: u64,
    client: Option<Arc<ClientGuard>>,
    shutdown: Option<CancellationToken>,
}

impl StreamSession {
    pub fn new(buffer: Arc<FrameBuffer>, poll: Duration) -> Self {
        Self {
            buffer,
            last_sent: 0,
            poll,
            frames_sent: 0,
            client: None,
            shutdown: None,
        }
    }

    /// Attribute delivered frames to a registered client
    pub fn with_client(mut self, client: Arc<ClientGuard>) -> Self {
        self.client = Some(client);
        self
    }

    /// End the session when `token` is cancelled
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    pub fn last_sent(&self) -> u64 {
        self.last_sent
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Deliver frames until the client disconnects or shutdown is requested.
    /// Returns the number of frames written.
    pub async fn run<S: FrameSink + ?Sized>(&mut self, sink: &mut S) -> u64 {
        let shutdown = self.shutdown.clone().unwrap_or_default();

        loop {
            if sink.is_closed() {
                debug!("Stream sink closed after {} frames", self.frames_sent);
                break;
            }

            let outcome = tokio::select! {
                _ = shutdown.cancelled() => break,
                outcome = self.buffer.wait_for_next(self.last_sent, self.poll) => outcome,
            };

            let frame = match outcome {
                WaitOutcome::Frame(frame) => frame,
                WaitOutcome::TimedOut => {
                    trace!("No new frame after seq {}", self.last_sent);
                    continue;
                }
            };

            let written = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                res = sink.write_chunk(create_mjpeg_part(frame.data())) => res,
                _ = self.buffer.published_after(frame.sequence) => {
                    trace!("Frame {} superseded before the client took it", frame.sequence);
                    continue;
                }
            };
            if written.is_err() {
                debug!("Stream write failed after {} frames", self.frames_sent);
                break;
            }

            self.last_sent = frame.sequence;
            self.frames_sent += 1;
            if let Some(client) = &self.client {
                client.record_frame_sent(frame.sequence);
            }
        }

        self.frames_sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::mjpeg::{ClientId, ClientRegistry};
    use crate::video::format::Resolution;

    const PART_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";

    fn jpeg(tag: u8) -> Bytes {
        Bytes::from(vec![0xFF, 0xD8, tag, 0xFF, 0xD9])
    }

    /// Pull the tag byte back out of a part built from [`jpeg`]
    fn tag_of(part: &Bytes) -> u8 {
        assert!(part.starts_with(PART_HEADER));
        assert!(part.ends_with(b"\xFF\xD9\r\n"));
        part[PART_HEADER.len() + 2]
    }

    fn spawn_session(
        buffer: &Arc<FrameBuffer>,
        poll: Duration,
    ) -> (mpsc::Receiver<Bytes>, tokio::task::JoinHandle<u64>) {
        let (mut tx, rx) = mpsc::channel::<Bytes>(1);
        let mut session = StreamSession::new(buffer.clone(), poll);
        let handle = tokio::spawn(async move { session.run(&mut tx).await });
        (rx, handle)
    }

    /// Session attributed to a new client on `registry`; returns the client key too
    fn spawn_client_session(
        buffer: &Arc<FrameBuffer>,
        registry: &Arc<ClientRegistry>,
        client_id: &str,
    ) -> (mpsc::Receiver<Bytes>, tokio::task::JoinHandle<u64>, ClientId) {
        let guard = Arc::new(ClientGuard::new(client_id.to_string(), registry.clone()));
        let key = guard.id().clone();
        let (mut tx, rx) = mpsc::channel::<Bytes>(1);
        let mut session =
            StreamSession::new(buffer.clone(), Duration::from_millis(50)).with_client(guard);
        let handle = tokio::spawn(async move { session.run(&mut tx).await });
        (rx, handle, key)
    }

    async fn recv(rx: &mut mpsc::Receiver<Bytes>) -> Bytes {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for part")
            .expect("session ended")
    }

    /// Collects chunks and reports itself closed after `limit` of them
    struct CollectSink {
        chunks: Vec<Bytes>,
        limit: usize,
    }

    #[async_trait]
    impl FrameSink for CollectSink {
        async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), SinkClosed> {
            if self.chunks.len() >= self.limit {
                return Err(SinkClosed);
            }
            self.chunks.push(chunk);
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.chunks.len() >= self.limit
        }
    }

    #[tokio::test]
    async fn test_session_before_first_publish_gets_first_frame() {
        let buffer = Arc::new(FrameBuffer::new());
        let (mut rx, handle) = spawn_session(&buffer, Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.publish(jpeg(1), Resolution::VGA);
        assert_eq!(tag_of(&recv(&mut rx).await), 1);

        buffer.publish(jpeg(2), Resolution::VGA);
        assert_eq!(tag_of(&recv(&mut rx).await), 2);

        drop(rx);
        assert_eq!(handle.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_late_joiner_never_sees_older_frames() {
        let buffer = Arc::new(FrameBuffer::new());
        for seq in 1..=5u8 {
            buffer.publish(jpeg(seq), Resolution::VGA);
        }

        let (mut rx, handle) = spawn_session(&buffer, Duration::from_millis(50));
        assert_eq!(tag_of(&recv(&mut rx).await), 5);

        for seq in 6..=10u8 {
            buffer.publish(jpeg(seq), Resolution::VGA);
            assert_eq!(tag_of(&recv(&mut rx).await), seq);
        }

        drop(rx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_fast_producer_yields_increasing_sequence_without_duplicates() {
        let buffer = Arc::new(FrameBuffer::new());
        let (mut rx, handle) = spawn_session(&buffer, Duration::from_millis(50));

        let producer = {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                for seq in 1..=100u8 {
                    buffer.publish(jpeg(seq), Resolution::VGA);
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut seen = Vec::new();
        loop {
            let tag = tag_of(&recv(&mut rx).await);
            seen.push(tag);
            if tag == 100 {
                break;
            }
        }
        producer.await.unwrap();

        assert!(seen.windows(2).all(|w| w[0] < w[1]), "{:?}", seen);

        drop(rx);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_notices_disconnect_on_timeout() {
        let buffer = Arc::new(FrameBuffer::new());
        let (rx, handle) = spawn_session(&buffer, Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(rx);

        assert_eq!(handle.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sink_failure_ends_session() {
        let buffer = Arc::new(FrameBuffer::new());
        buffer.publish(jpeg(1), Resolution::VGA);

        let mut sink = CollectSink {
            chunks: Vec::new(),
            limit: 1,
        };
        let mut session = StreamSession::new(buffer.clone(), Duration::from_millis(20));
        let sent = session.run(&mut sink).await;

        assert_eq!(sent, 1);
        assert_eq!(session.last_sent(), 1);
        assert_eq!(sink.chunks.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_ends_waiting_session() {
        let buffer = Arc::new(FrameBuffer::new());
        let token = CancellationToken::new();
        let (mut tx, _rx) = mpsc::channel::<Bytes>(1);

        let handle = {
            let token = token.clone();
            let mut session =
                StreamSession::new(buffer.clone(), Duration::from_secs(30)).with_shutdown(token);
            tokio::spawn(async move { session.run(&mut tx).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        let sent = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sent, 0);
    }

    #[tokio::test]
    async fn test_frames_are_attributed_to_client() {
        let buffer = Arc::new(FrameBuffer::new());
        let registry = Arc::new(ClientRegistry::new());
        let guard = Arc::new(ClientGuard::new("viewer".to_string(), registry.clone()));

        buffer.publish(jpeg(1), Resolution::VGA);
        let mut sink = CollectSink {
            chunks: Vec::new(),
            limit: 1,
        };
        let mut session =
            StreamSession::new(buffer.clone(), Duration::from_millis(20)).with_client(guard);
        session.run(&mut sink).await;

        let client = registry.get("viewer").unwrap();
        assert_eq!(client.frames_sent, 1);
        assert_eq!(client.last_sequence, 1);

        drop(session);
        assert_eq!(registry.client_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_write_is_dropped_for_newer_frame() {
        let buffer = Arc::new(FrameBuffer::new());
        let (mut rx, handle) = spawn_session(&buffer, Duration::from_secs(1));

        // Frame 1 fills the channel, frame 2 parks in a pending write
        buffer.publish(jpeg(1), Resolution::VGA);
        tokio::time::sleep(Duration::from_millis(10)).await;
        buffer.publish(jpeg(2), Resolution::VGA);
        tokio::time::sleep(Duration::from_millis(10)).await;
        buffer.publish(jpeg(3), Resolution::VGA);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(tag_of(&recv(&mut rx).await), 1);
        assert_eq!(tag_of(&recv(&mut rx).await), 3);

        drop(rx);
        assert_eq!(handle.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_stalled_client_does_not_hold_back_others() {
        const FRAMES: u8 = 20;

        let buffer = Arc::new(FrameBuffer::new());
        let registry = Arc::new(ClientRegistry::new());
        let (mut healthy_rx, healthy, _) = spawn_client_session(&buffer, &registry, "healthy");
        // Never drained: after one part the channel stays full
        let (stalled_rx, stalled, stalled_id) = spawn_client_session(&buffer, &registry, "stalled");

        let drain = tokio::spawn(async move {
            let mut seen = Vec::new();
            loop {
                let tag = tag_of(&recv(&mut healthy_rx).await);
                seen.push(tag);
                if tag == FRAMES {
                    return (seen, healthy_rx);
                }
            }
        });

        let mut stalled_last = 0;
        for seq in 1..=FRAMES {
            let started = std::time::Instant::now();
            assert_eq!(buffer.publish(jpeg(seq), Resolution::VGA), seq as u64);
            assert!(started.elapsed() < Duration::from_millis(100));

            tokio::time::sleep(Duration::from_millis(2)).await;

            let last = registry.get(&stalled_id).unwrap().last_sequence;
            assert!(last >= stalled_last, "{} went back to {}", stalled_last, last);
            assert!(last <= seq as u64);
            stalled_last = last;
        }

        let (seen, healthy_rx) = tokio::time::timeout(Duration::from_secs(5), drain)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen.last(), Some(&FRAMES));
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "{:?}", seen);

        // The stalled client only ever took the first part
        assert_eq!(registry.get(&stalled_id).unwrap().frames_sent, 1);
        assert!(!stalled.is_finished());

        drop(stalled_rx);
        drop(healthy_rx);
        tokio::time::timeout(Duration::from_secs(5), stalled)
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), healthy)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(registry.client_count(), 0);
    }
}
