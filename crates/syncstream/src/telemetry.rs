//! Process-wide tracing setup.
//!
//! Library code logs through `tracing` and `log`; hosts call
//! [`init_tracing`] once to install a subscriber that prints both.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::SyncStreamError;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Installs the global subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Returns
/// `Ok(false)` when tracing was already initialized by an earlier call.
pub fn init_tracing(config: &LoggingConfig) -> Result<bool, SyncStreamError> {
    if INITIALIZED.swap(true, Ordering::AcqRel) {
        return Ok(false);
    }

    tracing_log::LogTracer::init().map_err(|e| SyncStreamError::Telemetry(e.to_string()))?;

    let filter = build_filter(&config.level)?;
    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.json {
        tracing::subscriber::set_global_default(registry.with(fmt::layer().json()))
    } else {
        tracing::subscriber::set_global_default(registry.with(fmt::layer()))
    };
    result.map_err(|e| SyncStreamError::Telemetry(e.to_string()))?;

    tracing::debug!(json = config.json, level = %config.level, "tracing initialized");
    Ok(true)
}

fn build_filter(level: &str) -> Result<EnvFilter, SyncStreamError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level).map_err(|e| {
            SyncStreamError::Telemetry(format!("invalid log filter '{}': {}", level, e))
        }),
    }
}
