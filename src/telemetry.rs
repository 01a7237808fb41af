//! Logging initialisation for applications embedding the sync core.

use crate::config::{LogConfig, LogFormat};
use crate::error::{Result, SyncError};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Installs the global `tracing` subscriber.
///
/// Returns `Ok(false)` when a subscriber was already installed, so tests and hosts that
/// set up their own logging can call this unconditionally.
pub fn init(config: &LogConfig) -> Result<bool> {
    let default_level: LevelFilter = config
        .level
        .parse()
        .map_err(|_| SyncError::Config(format!("Invalid log level: {}", config.level)))?;

    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = match config.format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init()
            .is_ok(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
            .is_ok(),
    };
    Ok(installed)
}
