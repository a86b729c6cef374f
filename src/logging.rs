//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::config::ApplicationConfig;

/// Installs the global subscriber.
///
/// `RUST_LOG` wins over the configured level when it is set. Calling this twice is
/// harmless; the second call leaves the first subscriber in place.
pub fn init(config: &ApplicationConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = if config.json_logs {
        builder.json().with_current_span(false).try_init()
    } else {
        builder.with_ansi(true).try_init()
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
