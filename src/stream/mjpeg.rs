//! MJPEG wire format and connected-client bookkeeping

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Multipart boundary used by `/stream`
pub const BOUNDARY: &str = "frame";

/// Content type of the `/stream` response
pub const MJPEG_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Build one multipart part:
/// `--frame\r\nContent-Type: image/jpeg\r\n\r\n<jpeg>\r\n`
pub fn create_mjpeg_part(jpeg_data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(48 + jpeg_data.len());
    buf.put_slice(b"--");
    buf.put_slice(BOUNDARY.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Content-Type: image/jpeg\r\n");
    buf.put_slice(b"\r\n");
    buf.put_slice(jpeg_data);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Client ID type (UUID string unless the client supplied one)
pub type ClientId = String;

/// Per-client statistics
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub id: ClientId,
    pub connected_at: Instant,
    /// Last time a frame was handed to this client
    pub last_activity: Instant,
    pub frames_sent: u64,
    /// Sequence of the last frame sent
    pub last_sequence: u64,
}

impl ClientSession {
    pub fn new(id: ClientId) -> Self {
        let now = Instant::now();
        Self {
            id,
            connected_at: now,
            last_activity: now,
            frames_sent: 0,
            last_sequence: 0,
        }
    }

    pub fn connected_duration(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub fn average_fps(&self) -> f32 {
        let secs = self.connected_duration().as_secs_f32();
        if secs > 0.1 {
            self.frames_sent as f32 / secs
        } else {
            0.0
        }
    }
}

/// Registry of connected `/stream` clients
#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<ClientId, ClientSession>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Register a client and return the key it is tracked under.
    ///
    /// Client ids come from the query string, so two viewers may ask for the
    /// same one; a taken id gets a uuid suffix.
    pub fn register(&self, client_id: ClientId) -> ClientId {
        let (key, count) = {
            let mut clients = self.clients.write();
            let key = if clients.contains_key(&client_id) {
                format!("{}-{}", client_id, uuid::Uuid::new_v4().simple())
            } else {
                client_id
            };
            clients.insert(key.clone(), ClientSession::new(key.clone()));
            (key, clients.len())
        };
        info!("Client {} connected (total: {})", key, count);
        key
    }

    pub fn unregister(&self, client_id: &str) {
        let removed = self.clients.write().remove(client_id);
        if let Some(session) = removed {
            info!(
                "Client {} disconnected after {:.1}s ({} frames, {:.1} avg FPS)",
                client_id,
                session.connected_duration().as_secs_f32(),
                session.frames_sent,
                session.average_fps()
            );
        }
    }

    pub fn record_frame_sent(&self, client_id: &str, sequence: u64) {
        if let Some(session) = self.clients.write().get_mut(client_id) {
            session.last_activity = Instant::now();
            session.frames_sent += 1;
            session.last_sequence = sequence;
        }
    }

    pub fn get(&self, client_id: &str) -> Option<ClientSession> {
        self.clients.read().get(client_id).cloned()
    }

    pub fn sessions(&self) -> Vec<ClientSession> {
        self.clients.read().values().cloned().collect()
    }
}

/// RAII registration of one client; unregisters on drop, including when the
/// serving task is cancelled or panics
pub struct ClientGuard {
    client_id: ClientId,
    registry: Arc<ClientRegistry>,
}

impl ClientGuard {
    pub fn new(client_id: ClientId, registry: Arc<ClientRegistry>) -> Self {
        let client_id = registry.register(client_id);
        Self {
            client_id,
            registry,
        }
    }

    pub fn id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn record_frame_sent(&self, sequence: u64) {
        self.registry.record_frame_sent(&self.client_id, sequence);
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.client_id);
    }
}
