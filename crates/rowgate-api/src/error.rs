//! Error types for server startup and shutdown.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Convenience alias for server results.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors raised while composing, starting or stopping the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The configuration document was rejected.
    #[error("invalid configuration: {source}")]
    Config {
        /// Source configuration error.
        source: rowgate_config::ConfigError,
    },

    /// A datasource failed during startup.
    #[error("datasource setup failed: {source}")]
    Datasource {
        /// Source data-layer error.
        source: rowgate_data::DataError,
    },

    /// The notification dispatcher for a datasource failed to start.
    #[error("failed to start notification dispatcher for {datasource:?}: {source}")]
    Dispatcher {
        /// Datasource whose dispatcher failed.
        datasource: String,
        /// Source data-layer error.
        source: rowgate_data::DataError,
    },

    /// A job could not be scheduled.
    #[error("failed to schedule job {job:?}: {detail}")]
    Schedule {
        /// Job name.
        job: String,
        /// Parser detail.
        detail: String,
    },

    /// The HTTP listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address the server attempted to bind.
        addr: SocketAddr,
        /// Source IO error.
        source: io::Error,
    },
}
