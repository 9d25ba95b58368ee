use std::net::SocketAddr;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mjpeg_relay::config::{
    AppConfig, CaptureRetryConfig, SourceKind, StreamConfig, VideoConfig, WebConfig,
};
use mjpeg_relay::state::AppState;
use mjpeg_relay::stream::FrameBuffer;
use mjpeg_relay::video::{create_device, CaptureLoop, JpegEncoder};
use mjpeg_relay::web;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// mjpeg-relay command line arguments
///
/// Every option can also be set through the environment variable shown.
#[derive(Parser, Debug)]
#[command(name = "mjpeg-relay")]
#[command(version, about = "Relay a camera to any number of HTTP MJPEG clients", long_about = None)]
struct CliArgs {
    /// Listen address
    #[arg(short = 'a', long = "host", env = "STREAM_HOST", default_value = "0.0.0.0")]
    address: String,

    /// HTTP port
    #[arg(short = 'p', long = "port", env = "STREAM_PORT", default_value_t = 8080)]
    http_port: u16,

    /// Frame source
    #[arg(long, env = "CAPTURE_SOURCE", value_enum, default_value_t = SourceKind::default())]
    source: SourceKind,

    /// Capture device index (/dev/video{N})
    #[arg(short = 'c', long, env = "CAMERA_INDEX", default_value_t = 1)]
    camera_index: u32,

    /// Frames per second requested from the device
    #[arg(long, env = "TARGET_FPS", default_value_t = 25)]
    target_fps: u32,

    /// JPEG quality (1-100)
    #[arg(short = 'q', long, env = "JPEG_QUALITY", default_value_t = 70)]
    jpeg_quality: u8,

    /// Requested frame width
    #[arg(long, env = "STREAM_WIDTH", default_value_t = 640)]
    width: u32,

    /// Requested frame height
    #[arg(long, env = "STREAM_HEIGHT", default_value_t = 480)]
    height: u32,

    /// Consecutive failed reads before the device is reopened
    #[arg(long, env = "CAPTURE_FAILURE_THRESHOLD", default_value_t = 5)]
    failure_threshold: u32,

    /// Delay between failed open attempts (ms)
    #[arg(long, env = "CAPTURE_OPEN_BACKOFF_MS", default_value_t = 2000)]
    open_backoff_ms: u64,

    /// Delay after closing a failing device before reopening it (ms)
    #[arg(long, env = "CAPTURE_REOPEN_DELAY_MS", default_value_t = 1000)]
    reopen_delay_ms: u64,

    /// Delay before retrying a failed read (ms)
    #[arg(long, env = "CAPTURE_READ_RETRY_MS", default_value_t = 200)]
    read_retry_ms: u64,

    /// Make every Nth test-pattern read fail, to exercise recovery (0 = never)
    #[arg(long, env = "CAPTURE_INJECT_FAILURE_EVERY", default_value_t = 0)]
    inject_read_failure_every: u64,

    /// How often an idle stream re-checks its client (ms)
    #[arg(long, env = "STREAM_SESSION_POLL_MS", default_value_t = 1000)]
    session_poll_ms: u64,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl CliArgs {
    fn to_config(&self) -> AppConfig {
        AppConfig {
            web: WebConfig {
                bind_address: self.address.clone(),
                http_port: self.http_port,
            },
            video: VideoConfig {
                source: self.source,
                camera_index: self.camera_index,
                width: self.width,
                height: self.height,
                fps: self.target_fps,
                quality: self.jpeg_quality,
                inject_read_failure_every: self.inject_read_failure_every,
            },
            capture: CaptureRetryConfig {
                failure_threshold: self.failure_threshold,
                open_backoff_ms: self.open_backoff_ms,
                reopen_delay_ms: self.reopen_delay_ms,
                read_retry_ms: self.read_retry_ms,
            },
            stream: StreamConfig {
                session_poll_ms: self.session_poll_ms,
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting mjpeg-relay v{}", env!("CARGO_PKG_VERSION"));

    let config = args.to_config().validate()?;
    tracing::info!(
        "Config: {} camera {} at {}x{} @ {}fps, quality {}",
        config.video.source,
        config.video.camera_index,
        config.video.width,
        config.video.height,
        config.video.fps,
        config.video.quality
    );

    let frames = std::sync::Arc::new(FrameBuffer::new());
    let device = create_device(&config.video)?;
    let encoder = JpegEncoder::new(config.video.quality);
    let capture = CaptureLoop::new(device, encoder, frames.clone(), config.capture.clone());

    let shutdown = CancellationToken::new();
    let state = AppState::new(
        config.clone(),
        frames,
        capture.state_watch(),
        capture.stats_handle(),
        shutdown.clone(),
    );

    let capture_handle = {
        let shutdown = shutdown.clone();
        tokio::task::spawn_blocking(move || capture.run(shutdown))
    };

    let app = web::create_router(state);

    let ip: std::net::IpAddr = config
        .web
        .bind_address
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address {}: {}", config.web.bind_address, e))?;
    let addr = SocketAddr::new(ip, config.web.http_port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Starting HTTP server on {}", listener.local_addr()?);

    tokio::select! {
        _ = shutdown_signal() => {}
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                tracing::error!("HTTP server error: {}", e);
            }
        }
    }

    // Ends open streams and the capture loop
    shutdown.cancel();
    if let Err(e) = capture_handle.await {
        tracing::error!("Capture task failed: {}", e);
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install CTRL+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown signal received");
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "mjpeg_relay=error,tower_http=error",
        LogLevel::Warn => "mjpeg_relay=warn,tower_http=warn",
        LogLevel::Info => "mjpeg_relay=info,tower_http=info",
        LogLevel::Verbose => "mjpeg_relay=debug,tower_http=info",
        LogLevel::Debug => "mjpeg_relay=debug,tower_http=debug",
        LogLevel::Trace => "mjpeg_relay=trace,tower_http=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_match_config_defaults() {
        let args = CliArgs::try_parse_from(["mjpeg-relay"]).unwrap();
        let config = args.to_config();
        let defaults = AppConfig::default();

        assert_eq!(config.web.http_port, defaults.web.http_port);
        assert_eq!(config.web.bind_address, defaults.web.bind_address);
        assert_eq!(config.video.camera_index, defaults.video.camera_index);
        assert_eq!(config.video.fps, defaults.video.fps);
        assert_eq!(config.video.quality, defaults.video.quality);
        assert_eq!(
            config.video.inject_read_failure_every,
            defaults.video.inject_read_failure_every
        );
        assert_eq!(config.capture.failure_threshold, defaults.capture.failure_threshold);
        assert_eq!(config.stream.session_poll_ms, defaults.stream.session_poll_ms);
    }

    #[test]
    fn test_cli_overrides() {
        let args = CliArgs::try_parse_from([
            "mjpeg-relay",
            "--port",
            "9000",
            "--source",
            "test-pattern",
            "--camera-index",
            "0",
            "--jpeg-quality",
            "90",
            "--failure-threshold",
            "3",
            "--inject-read-failure-every",
            "10",
        ])
        .unwrap();
        let config = args.to_config();

        assert_eq!(config.web.http_port, 9000);
        assert_eq!(config.video.source, SourceKind::TestPattern);
        assert_eq!(config.video.camera_index, 0);
        assert_eq!(config.video.quality, 90);
        assert_eq!(config.capture.failure_threshold, 3);
        assert_eq!(config.video.inject_read_failure_every, 10);
    }
}
