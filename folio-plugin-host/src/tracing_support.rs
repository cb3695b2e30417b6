//! Tracing subscriber setup for host binaries.
//!
//! The runtime itself only emits `tracing` events; embedding applications
//! decide where they go. This module offers a one-call setup driven by the
//! `[logging]` section of the host configuration.

use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn filter(config: &LoggingConfig) -> EnvFilter {
    match &config.level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    }
}

/// Initialize the global subscriber with default settings.
///
/// Uses `RUST_LOG` for filtering and falls back to `info`.
///
/// # Environment Variables
///
/// - `RUST_LOG=debug` - Enable debug logs
/// - `RUST_LOG=folio_plugin_host=trace` - Per-module filtering
pub fn init_subscriber() -> Result<(), TryInitError> {
    init_subscriber_with_config(&LoggingConfig::default())
}

/// Initialize the global subscriber from configuration.
///
/// Fails if a global subscriber is already installed.
///
/// # Example
///
/// ```ignore
/// use folio_plugin_host::config::HostConfig;
/// use folio_plugin_host::tracing_support::init_subscriber_with_config;
///
/// let config = HostConfig::load("folio.toml")?;
/// init_subscriber_with_config(&config.logging)?;
/// ```
pub fn init_subscriber_with_config(config: &LoggingConfig) -> Result<(), TryInitError> {
    let filter = filter(config);

    match (config.format, config.timestamps) {
        (LogFormat::Pretty, true) => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_target(config.target)
                    .with_thread_ids(config.thread_ids),
            )
            .try_init(),
        (LogFormat::Pretty, false) => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .without_time()
                    .with_target(config.target)
                    .with_thread_ids(config.thread_ids),
            )
            .try_init(),
        (LogFormat::Compact, true) => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(config.target)
                    .with_thread_ids(config.thread_ids),
            )
            .try_init(),
        (LogFormat::Compact, false) => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .without_time()
                    .with_target(config.target)
                    .with_thread_ids(config.thread_ids),
            )
            .try_init(),
        (LogFormat::Json, true) => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(config.target)
                    .with_thread_ids(config.thread_ids),
            )
            .try_init(),
        (LogFormat::Json, false) => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .without_time()
                    .with_target(config.target)
                    .with_thread_ids(config.thread_ids),
            )
            .try_init(),
    }
}
