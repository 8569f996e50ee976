#![forbid(unsafe_code)]

//! Declarative configuration for the Rowgate API server.
//!
//! # Design
//! - `model.rs` holds the typed document (endpoints, streams, jobs,
//!   datasources) exactly as it appears on the wire.
//! - `validate.rs` is a two-pass validator: structural shapes first, then
//!   cross-references (name uniqueness, datasource resolution).
//! - `loader.rs` reads the document from JSON or YAML files.
//!
//! The schema is semver-stable at v1.0.0; only the major-1 family is
//! accepted.

pub mod error;
pub mod loader;
pub mod model;
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use loader::{load_config, ConfigFormat};
pub use model::{
    ConnPool, Cors, Datasource, Endpoint, ImplKind, Job, JobKind, Param, ParamLocation, ParamType,
    ServerConfig, Stream, StreamKind, TxAccess, TxIsolation, TxOptions,
};
pub use validate::{listen_addr, parse_cron_schedule, Severity, ValidationFinding};

/// Semver version of the configuration schema understood by this build.
pub const SCHEMA_VERSION: &str = "1.0.0";
