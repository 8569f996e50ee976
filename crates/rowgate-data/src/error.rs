//! Error types for datasource operations.

use thiserror::Error;

/// Convenience alias for data-layer results.
pub type Result<T> = std::result::Result<T, DataError>;

/// Primary error type for datasource operations.
#[derive(Debug, Error)]
pub enum DataError {
    /// A named datasource does not exist in the configuration.
    #[error("datasource {name:?} not found")]
    UnknownSource {
        /// Datasource name that failed to resolve.
        name: String,
    },

    /// Establishing the connection pool failed.
    #[error("failed to connect to datasource {name:?}: {source}")]
    Connect {
        /// Datasource that failed to connect.
        name: String,
        /// Source database error.
        source: sqlx::Error,
    },

    /// Acquiring a connection from the pool failed.
    #[error("failed to acquire connection from {name:?}: {source}")]
    Acquire {
        /// Datasource whose pool could not supply a connection.
        name: String,
        /// Source database error.
        source: sqlx::Error,
    },

    /// A SQL operation failed. Rendered in the PostgreSQL
    /// `ERROR: … (SQLSTATE …)` format when the failure came from the
    /// server.
    #[error("{}", describe(.source))]
    Query {
        /// Source database error.
        source: sqlx::Error,
    },

    /// The operation exceeded its deadline.
    #[error("operation timed out")]
    Timeout,
}

impl DataError {
    pub(crate) fn query(source: sqlx::Error) -> Self {
        Self::Query { source }
    }
}

/// Render a database error the way the server reports it: server-side
/// failures as `ERROR: <message> (SQLSTATE <code>)`, everything else via
/// its display form.
fn describe(err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db) => {
            let code = db.code().unwrap_or_default();
            format!("ERROR: {} (SQLSTATE {})", db.message(), code)
        }
        other => other.to_string(),
    }
}
