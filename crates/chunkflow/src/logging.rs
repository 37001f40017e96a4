//! Subscriber setup. `log` records from this crate and its dependencies are
//! bridged into `tracing` so both end up in the same output.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::LoggingError;

/// Installs the global subscriber. `RUST_LOG` overrides the configured level.
/// A second call returns an error and leaves the first subscriber in place.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let registry = tracing_subscriber::registry().with(filter);

    if config.json {
        tracing::subscriber::set_global_default(registry.with(fmt::layer().json()))?;
    } else {
        tracing::subscriber::set_global_default(registry.with(fmt::layer()))?;
    }
    tracing_log::LogTracer::init()?;

    log::debug!("Logging initialized at level '{}'", config.level);
    Ok(())
}
