use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let stream_routes = Router::new()
        .route("/stream", get(handlers::mjpeg_stream))
        .route("/snapshot", get(handlers::snapshot));

    let status_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/stats", get(handlers::stats));

    Router::new()
        .merge(stream_routes)
        .merge(status_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
