//! # Motion Uplink
//!
//! Capture accelerometer samples and stream them to a remote collector.
//!
//! This application runs one tracking session from start-up until Ctrl+C,
//! buffering simulated samples and uploading them in batches.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use motion_uplink::config::{Config, LoggingConfig};
use motion_uplink::telemetry::identity::{FileIdentityStore, IdentityProvider};
use motion_uplink::telemetry::session::{PipelineSettings, SessionController};
use motion_uplink::telemetry::source::SimulatedSource;
use motion_uplink::telemetry::uploader::HttpEndpoint;

/// Configuration file used when no path is given
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Seconds between status log messages
const STATUS_LOG_INTERVAL_SECS: u64 = 10;

/// Daily rolling log file name prefix
const LOG_FILE_PREFIX: &str = "motion-uplink.log";

/// Main entry point for Motion Uplink
///
/// # Control Flow
///
/// 1. **Initialization**
///    - Load configuration (first argument, or `config/default.toml`)
///    - Set up logging with tracing subscriber
///    - Resolve the device identity and build the HTTP endpoint
///
/// 2. **Tracking**
///    - Start a session on the simulated source
///    - Log pipeline status every 10 seconds
///
/// 3. **Graceful Shutdown**
///    - On Ctrl+C, stop the session and wait for the final flush
///    - Log the stop report
///
/// # Errors
///
/// Returns error if:
/// - The configuration file is unreadable or invalid
/// - The HTTP client cannot be built
///
/// # Examples
///
/// ```bash
/// cargo run --release -- config/default.toml
/// ```
#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    let _log_guard = init_logging(&config.logging)?;

    info!("Motion Uplink v{} starting...", env!("CARGO_PKG_VERSION"));

    let identity = Arc::new(IdentityProvider::new(Arc::new(FileIdentityStore::new(
        &config.identity.path,
    ))));
    let endpoint = HttpEndpoint::new(&config.upload.endpoint_url, config.upload.timeout())
        .context("Failed to build upload client")?;
    info!("Uploading to {}", endpoint.url());

    let source = Arc::new(SimulatedSource::new(config.source.sampling_rate_hz));

    let mut controller = SessionController::new(
        PipelineSettings::from(&config),
        identity,
        source,
        Arc::new(endpoint),
    );

    let session = controller.start()?;
    info!(
        "Tracking session {} at {}Hz, press Ctrl+C to stop",
        session.session_id, config.source.sampling_rate_hz
    );

    let mut status_interval = interval(Duration::from_secs(STATUS_LOG_INTERVAL_SECS));
    status_interval.tick().await;

    loop {
        tokio::select! {
            _ = status_interval.tick() => {
                let status = controller.status();
                info!(
                    "Buffered {}, delivered {} samples in {} batches, shed {}",
                    status.buffered, status.samples_delivered, status.batches_delivered, status.shed_total
                );
                if let Some(error) = &status.last_error {
                    warn!("Last upload error: {}", error);
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    if let Some(report) = controller.stop().await {
        info!("Final report: {}", serde_json::to_string(&report)?);
    }

    Ok(())
}

fn load_config() -> Result<Config> {
    let path = match std::env::args().nth(1) {
        Some(path) => path,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => DEFAULT_CONFIG_PATH.to_string(),
        None => {
            // Logging is not up yet
            eprintln!("No config at {}, using defaults", DEFAULT_CONFIG_PATH);
            return Ok(Config::default());
        }
    };

    Config::load(&path).with_context(|| format!("Failed to load config from {}", path))
}

/// Initialize stdout logging, plus a daily rolling file when configured.
///
/// `RUST_LOG` overrides the configured level. The returned guard must be held
/// for the life of the process or buffered file output is lost.
fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
    };

    if config.file_dir.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter()).init();
        return Ok(None);
    }

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let appender = tracing_appender::rolling::daily(&config.file_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter())
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
        .try_init()
        .context("Failed to install log subscriber")?;

    Ok(Some(guard))
}
