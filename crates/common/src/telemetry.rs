//! Logging initialization for sluice binaries.
//!
//! Installs a `tracing` subscriber built from [`TelemetryConfig`]: an `EnvFilter`
//! (the `RUST_LOG` environment variable wins over the configured filter) and a
//! `fmt` layer, optionally emitting JSON lines.

use anyhow::Result;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::TelemetryConfig;

/// Builds the filter for the subscriber.
pub fn env_filter(config: &TelemetryConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter))
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init_tracing(config: &TelemetryConfig) -> Result<()> {
    let registry = tracing_subscriber::registry().with(env_filter(config));

    if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?;
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()?;
    }

    tracing::debug!(filter = %config.log_filter, json = config.json, "Tracing initialized");
    Ok(())
}
