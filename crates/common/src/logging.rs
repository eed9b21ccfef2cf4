//! Logging initialization
//!
//! Diagnostics go to stderr so stdout stays reserved for result lines.

use std::io::IsTerminal;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Calling this more
/// than once is harmless; later calls leave the first subscriber in place.
pub fn init_logging(config: &LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(use_ansi(config, std::io::stderr().is_terminal()))
                .with_target(false),
        )
        .try_init();
}

/// Escape codes only reach an interactive terminal
fn use_ansi(config: &LoggingConfig, stderr_is_terminal: bool) -> bool {
    config.ansi && stderr_is_terminal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_init_is_harmless() {
        let config = LoggingConfig {
            level: "debug".to_string(),
            ansi: false,
        };
        init_logging(&config);
        init_logging(&config);
        tracing::debug!("logging initialized twice");
    }

    #[test]
    fn test_ansi_needs_a_terminal() {
        let config = LoggingConfig::default();
        assert!(use_ansi(&config, true));
        assert!(!use_ansi(&config, false));

        let plain = LoggingConfig {
            ansi: false,
            ..LoggingConfig::default()
        };
        assert!(!use_ansi(&plain, true));
    }
}
