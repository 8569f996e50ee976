//! Error types for configuration loading and validation.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read configuration file '{}'", path.display())]
    Read {
        /// Path that failed to load.
        path: PathBuf,
        /// Source IO error.
        source: io::Error,
    },
    /// The configuration file could not be decoded as JSON.
    #[error("failed to decode json: {source}")]
    DecodeJson {
        /// Source decoding error.
        source: serde_json::Error,
    },
    /// The configuration file could not be decoded as YAML.
    #[error("failed to decode yaml: {source}")]
    DecodeYaml {
        /// Source decoding error.
        source: serde_yaml::Error,
    },
    /// Validation produced at least one error finding.
    #[error("{count} errors: {joined}")]
    Invalid {
        /// Number of error findings.
        count: usize,
        /// All error messages joined with `; `.
        joined: String,
    },
    /// The listen specifier could not be parsed into a socket address.
    #[error("invalid listen specification {value:?}")]
    InvalidListen {
        /// Offending listen specifier.
        value: String,
    },
}

/// Convenience alias for configuration results.
pub type ConfigResult<T> = Result<T, ConfigError>;
