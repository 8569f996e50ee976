#![forbid(unsafe_code)]

//! Telemetry initialisation for Rowgate.
//!
//! # Design
//! - Centralises logging setup (text or JSON) with a single entry point;
//!   library crates only emit `tracing` events.
//! - The filter honours `RUST_LOG` and falls back to `info`.

use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default logging target when `RUST_LOG` is not provided.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Errors raised during telemetry setup.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Installing the global subscriber failed (usually because one is
    /// already set).
    #[error("failed to install tracing subscriber: {detail}")]
    Init {
        /// Underlying failure description.
        detail: String,
    },
}

/// Available output formats for the logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, optionally colorized output.
    Text,
    /// One JSON object per event.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Output format selection for the subscriber.
    pub format: LogFormat,
    /// Whether ANSI colors are allowed (text format only).
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            ansi: true,
        }
    }
}

/// Configure and install the global tracing subscriber.
///
/// # Errors
///
/// Returns an error if the subscriber cannot be installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL));

    let result = match config.format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_ansi(config.ansi))
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_ansi(false))
            .try_init(),
    };

    result.map_err(|err| TelemetryError::Init {
        detail: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_colorized_text() {
        let config = LoggingConfig::default();
        assert_eq!(config.format, LogFormat::Text);
        assert!(config.ansi);
    }

    #[test]
    fn double_initialisation_is_reported() {
        let config = LoggingConfig {
            format: LogFormat::Text,
            ansi: false,
        };
        let _ = init_logging(&config);
        // A second installation (other tests may have supplied the first)
        // must fail cleanly rather than panic.
        assert!(init_logging(&config).is_err());
    }
}
