//! Tracing subscriber setup shared by every binary and test harness that embeds stow

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{StowError, StowResult};

/// Install the global subscriber. `RUST_LOG` overrides `config.level`.
///
/// Fails with `Config` when a subscriber is already installed, so callers
/// that may run twice (tests) should use [`try_init_logging`].
pub fn init_logging(config: &LoggingConfig) -> StowResult<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let result = match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .try_init(),
    };

    result.map_err(|e| StowError::Config(format!("installing log subscriber: {e}")))
}

/// Like [`init_logging`], but a second call is a no-op.
pub fn try_init_logging(config: &LoggingConfig) {
    let _ = init_logging(config);
}
