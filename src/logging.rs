//! Logging initialization.
//!
//! The RUST_LOG environment variable takes precedence over the configured level.

use crate::config::LoggingConfig;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging based on configuration.
///
/// Returns `false` if a global subscriber was already installed, which lets
/// embedding applications keep their own.
pub fn init(config: &LoggingConfig) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let result = match config.format.as_str() {
        "json" => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init(),
        "compact" => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .try_init(),
        _ => {
            // "pretty" or default
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .try_init()
        }
    };

    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_refused() {
        let config = LoggingConfig {
            level: "warn".to_string(),
            format: "compact".to_string(),
        };
        // The first call may lose to another test in this binary; the second
        // one never wins.
        let _ = init(&config);
        assert!(!init(&config));
    }
}
