use axum::{
    body::Body,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::config::SourceKind;
use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::stream::mjpeg::{ClientGuard, MJPEG_CONTENT_TYPE};
use crate::stream::StreamSession;

// ============================================================================
// Health & Stats
// ============================================================================

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub frame_ready: bool,
    pub frames_captured: u64,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let snapshot = state.frames.read_latest();
    Json(HealthResponse {
        status: "ok",
        frame_ready: snapshot.ready(),
        frames_captured: snapshot.sequence,
    })
}

#[derive(Serialize)]
pub struct CaptureInfo {
    pub state: String,
    pub consecutive_failures: u32,
    pub frames_captured: u64,
    pub read_failures: u64,
    pub open_failures: u64,
    pub reopens: u64,
    pub current_fps: f32,
    /// Age of the latest frame in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_frame_age_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct VideoInfo {
    pub source: SourceKind,
    pub camera_index: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub quality: u8,
}

#[derive(Serialize)]
pub struct ClientInfo {
    pub id: String,
    pub connected_secs: u64,
    pub frames_sent: u64,
    pub avg_fps: f32,
}

#[derive(Serialize)]
pub struct StatsResponse {
    pub uptime_secs: u64,
    pub capture: CaptureInfo,
    pub video: VideoInfo,
    pub clients: Vec<ClientInfo>,
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let capture_state = *state.capture_state.borrow();
    let counters = state.capture_stats.lock().clone();
    let latest = state.frames.latest();
    let video = &state.config.video;

    let mut clients: Vec<ClientInfo> = state
        .clients
        .sessions()
        .into_iter()
        .map(|session| ClientInfo {
            connected_secs: session.connected_duration().as_secs(),
            avg_fps: session.average_fps(),
            frames_sent: session.frames_sent,
            id: session.id,
        })
        .collect();
    clients.sort_by(|a, b| a.id.cmp(&b.id));

    Json(StatsResponse {
        uptime_secs: state.uptime_secs(),
        capture: CaptureInfo {
            state: capture_state.to_string(),
            consecutive_failures: capture_state.failures(),
            frames_captured: latest.as_ref().map(|f| f.sequence).unwrap_or(0),
            read_failures: counters.read_failures,
            open_failures: counters.open_failures,
            reopens: counters.reopens,
            current_fps: counters.current_fps,
            last_frame_age_ms: latest.map(|f| f.age().as_millis() as u64),
        },
        video: VideoInfo {
            source: video.source,
            camera_index: video.camera_index,
            width: video.width,
            height: video.height,
            fps: video.fps,
            quality: video.quality,
        },
        clients,
    })
}

// ============================================================================
// MJPEG
// ============================================================================

/// Query parameters for MJPEG stream
#[derive(Deserialize, Default)]
pub struct MjpegStreamQuery {
    /// Optional client ID (if not provided, a random UUID will be generated)
    pub client_id: Option<String>,
}

/// MJPEG stream endpoint
pub async fn mjpeg_stream(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MjpegStreamQuery>,
) -> Response {
    // Validate: non-empty, max 64 chars
    let client_id = query
        .client_id
        .filter(|id| !id.is_empty() && id.len() <= 64)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let guard = Arc::new(ClientGuard::new(client_id, state.clients.clone()));

    // Capacity 1: a slow client makes the session skip frames instead of queueing them
    let (mut tx, mut rx) = tokio::sync::mpsc::channel::<Bytes>(1);

    let mut session = StreamSession::new(state.frames.clone(), state.config.stream.session_poll())
        .with_client(guard.clone())
        .with_shutdown(state.shutdown.clone());

    tokio::spawn(async move {
        let sent = session.run(&mut tx).await;
        debug!("Stream session for {} ended after {} frames", guard.id(), sent);
    });

    let body_stream = async_stream::stream! {
        while let Some(data) = rx.recv().await {
            yield Ok::<Bytes, std::io::Error>(data);
        }
    };

    (
        [
            (header::CONTENT_TYPE, MJPEG_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            (header::PRAGMA, "no-cache"),
            (header::EXPIRES, "0"),
        ],
        Body::from_stream(body_stream),
    )
        .into_response()
}

/// Single JPEG snapshot
pub async fn snapshot(State(state): State<Arc<AppState>>) -> Result<Response> {
    let frame = state
        .frames
        .latest()
        .ok_or_else(|| AppError::ServiceUnavailable("No frame available yet".to_string()))?;

    Ok((
        [
            (header::CONTENT_TYPE, "image/jpeg"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from(frame.data_bytes()),
    )
        .into_response())
}
