//! Process-wide `tracing` subscriber.
//!
//! Library code only emits events. The embedding process installs one
//! subscriber, normally from the `[logging]` section of its configuration.
//! `RUST_LOG` takes precedence over the configured filter.

use crate::config::{LogFormat, LoggingConfig};
use crate::error::CoreError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn env_filter(fallback: &str) -> Result<EnvFilter, CoreError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(fallback)
            .map_err(|err| CoreError::Config(format!("log filter {fallback:?}: {err}"))),
    }
}

/// Install the subscriber described by `config`.
///
/// # Example
/// ```no_run
/// use tessera_core::{logging, Config};
///
/// let config = Config::default_config();
/// logging::init(&config.logging).unwrap();
/// tracing::info!(slot = 0, "slot provisioned");
/// ```
pub fn init(config: &LoggingConfig) -> Result<(), CoreError> {
    let filter = env_filter(&config.filter)?;
    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.format {
        LogFormat::Text => registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .try_init(),
    };
    installed.map_err(|err| CoreError::Config(format!("logging already initialized: {err}")))
}

/// Text subscriber writing through the test harness. Returns whether this
/// call installed it.
pub fn try_init() -> bool {
    let Ok(filter) = env_filter("debug") else {
        return false;
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_test_writer())
        .try_init()
        .is_ok()
}
