//! Tracing initialisation for the launcher.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Installs the global subscriber. `RUST_LOG` beats the configured filter;
/// the fallback is `info`. Later calls lose quietly, so tests can call this
/// too.
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.filter.as_deref().unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    let result = if config.stdout {
        builder.try_init()
    } else {
        builder.with_writer(std::io::sink).try_init()
    };
    if result.is_err() {
        tracing::debug!("telemetry already initialised");
    }
}
