//! Runtime configuration
//!
//! Values are collected from CLI flags and environment variables in `main`
//! and land in [`AppConfig`]. Nothing is persisted.

mod schema;

pub use schema::{
    AppConfig, CaptureRetryConfig, SourceKind, StreamConfig, VideoConfig, WebConfig,
};
