//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber once per process
//! - Honour `RUST_LOG` over the configured level
//! - Switch between compact and pretty output

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

/// Install the global subscriber.
///
/// Calling this twice is harmless: the second attempt is reported and ignored.
pub fn init_logging(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(&config.log_level)));

    let result = match config.log_format.as_str() {
        "pretty" => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init(),
        _ => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init(),
    };

    if let Err(e) = result {
        tracing::debug!("Logging already initialized: {}", e);
    }
}

fn default_directive(level: &str) -> String {
    format!("intercept_relay={level},intercept_relay::display=info,warn")
}
