//! Process-wide logging setup.
//!
//! Library code logs through the `log` facade and opens `tracing` spans;
//! [`init_logging`] routes both into one `tracing_subscriber` registry.

use std::sync::Mutex;

use tracing_log::LogTracer;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::EtlError;

static INSTALLED: Mutex<bool> = Mutex::new(false);

/// Installs the global subscriber. `RUST_LOG` wins over `config.level`.
///
/// Safe to call more than once: later calls return `Ok(())` and leave the
/// first subscriber in place.
pub fn init_logging(config: &LoggingConfig) -> Result<(), EtlError> {
    let mut installed = INSTALLED
        .lock()
        .map_err(|_| EtlError::Telemetry("logging init lock poisoned".to_string()))?;
    if *installed {
        return Ok(());
    }

    let filter = build_filter(config)?;

    LogTracer::init().map_err(|e| EtlError::Telemetry(e.to_string()))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.format {
        LogFormat::Json => {
            tracing::subscriber::set_global_default(registry.with(fmt::layer().json()))
        }
        LogFormat::Pretty => {
            tracing::subscriber::set_global_default(registry.with(fmt::layer().pretty()))
        }
    };
    result.map_err(|e| EtlError::Telemetry(e.to_string()))?;

    *installed = true;
    Ok(())
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, EtlError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| EtlError::Telemetry(format!("invalid log level '{}': {}", config.level, e))),
    }
}
