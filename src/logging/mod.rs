use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::{LogFormat, LoggingConfig};

/// Installs the global subscriber, or returns an error if one is already set.
pub fn try_init_logging(config: &LoggingConfig) -> Result<(), TryInitError> {
    let filter: EnvFilter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let base = fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_target(true);

    let formatting_layer = match config.format {
        LogFormat::Compact => base.compact().boxed(),
        LogFormat::Full => base.boxed(),
        LogFormat::Pretty => base.pretty().boxed(),
    };

    Registry::default()
        .with(formatting_layer)
        .with(filter)
        .try_init()
}

pub fn init_logging(config: &LoggingConfig) {
    if let Err(e) = try_init_logging(config) {
        eprintln!("logging already initialised: {e}");
    }
}
