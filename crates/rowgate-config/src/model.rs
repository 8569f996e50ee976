//! Typed configuration models for the Rowgate API server.
//!
//! # Design
//! - Pure data carriers deserialized from a JSON or YAML document; all
//!   wire names are semver-stable at v1.0.0.
//! - Free-form discriminator fields (`implType`, `in`, `type`, …) are kept
//!   as strings so that invalid values surface as validation findings
//!   rather than decode failures; typed accessors parse them after
//!   validation has passed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The entirety of the configuration supplied to the API server, typically
/// deserialized from a `.json` or `.yaml` file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Schema version in semver syntax (a trailing `.0` or `.0.0` may be
    /// omitted). Required; validation fails without it.
    pub version: String,

    /// `IP` or `IP:port` for the server to bind to. If the IP is omitted
    /// the server binds to all interfaces; if the port is omitted it
    /// defaults to 8080. IPv4 and bracketed IPv6 literals only, hostnames
    /// are rejected.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub listen: String,

    /// Prefix applied to every endpoint and stream URI. Must begin with a
    /// slash and must not end with one.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub common_prefix: String,

    /// Cross-Origin Resource Sharing configuration. When absent, no CORS
    /// headers are emitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cors: Option<Cors>,

    /// Enables transparent gzip/deflate response compression for the
    /// server as a whole.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub compression: bool,

    /// URIs implemented with queries, statements, static payloads or
    /// scripts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<Endpoint>,

    /// WebSocket and server-sent-event URIs fed by database NOTIFY
    /// channels.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub streams: Vec<Stream>,

    /// Scheduled jobs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jobs: Vec<Job>,

    /// PostgreSQL databases referenced by endpoints, streams and jobs.
    /// All are connected to at startup unless marked `lazy`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub datasources: Vec<Datasource>,
}

impl ServerConfig {
    /// Look up a datasource by name.
    #[must_use]
    pub fn datasource(&self, name: &str) -> Option<&Datasource> {
        self.datasources.iter().find(|d| d.name == name)
    }
}

/// A URI backed by one of the endpoint implementation kinds: a SQL query
/// returning JSON or CSV, a SQL statement, a static payload, or a script.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Endpoint {
    /// Path of the endpoint. Must start with a slash but not end with one;
    /// path components drawn from `[A-Za-z0-9_.-]`, optionally wrapped in
    /// curly brackets to act as a path parameter. Case-sensitive.
    pub uri: String,

    /// HTTP methods accepted by this endpoint (subset of GET, POST, PUT,
    /// PATCH, DELETE). Empty means any method.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,

    /// Parameters accepted by this endpoint. For SQL kinds they bind as
    /// `$1`, `$2`, …; for scripts they appear as `$sys.params`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Param>,

    /// One of `query-json`, `query-csv`, `exec`, `static-text`,
    /// `static-json` or `script`. Required.
    #[serde(rename = "implType")]
    pub impl_type: String,

    /// Name of the datasource used by SQL kinds. Ignored for static and
    /// script kinds (scripts acquire connections explicitly).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub datasource: String,

    /// The payload: SQL text for query/exec kinds (multiple statements are
    /// allowed for `exec` without parameters), literal JSON for
    /// `static-json`, plain text for `static-text`, script source for
    /// `script`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub script: String,

    /// Transaction options applied around SQL kinds.
    #[serde(default, rename = "tx", skip_serializing_if = "Option::is_none")]
    pub tx_options: Option<TxOptions>,

    /// Enables debug logging of all invocations of this endpoint.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub debug: bool,

    /// Timeout in seconds for SQL kinds. Ignored if <= 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,

    /// Cache the result for this many seconds, keyed by the exact
    /// parameter values of the invocation. Requires a runtime interface
    /// with cache support. Ignored if <= 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<f64>,
}

impl Endpoint {
    /// Parsed implementation kind; `None` until validation has accepted
    /// the `implType` string.
    #[must_use]
    pub fn kind(&self) -> Option<ImplKind> {
        ImplKind::parse(&self.impl_type)
    }
}

/// Endpoint implementation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImplKind {
    /// SELECT-like query rendered as JSON.
    QueryJson,
    /// SELECT-like query rendered as CSV.
    QueryCsv,
    /// SQL statement; responds with the affected row count.
    Exec,
    /// Static plain-text payload.
    StaticText,
    /// Static JSON payload (validated at config time).
    StaticJson,
    /// Script evaluated in the embedded sandbox.
    Script,
}

impl ImplKind {
    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "query-json" => Some(Self::QueryJson),
            "query-csv" => Some(Self::QueryCsv),
            "exec" => Some(Self::Exec),
            "static-text" => Some(Self::StaticText),
            "static-json" => Some(Self::StaticJson),
            "script" => Some(Self::Script),
            _ => None,
        }
    }

    /// Whether this kind executes SQL against a datasource.
    #[must_use]
    pub const fn is_sql(self) -> bool {
        matches!(self, Self::QueryJson | Self::QueryCsv | Self::Exec)
    }
}

/// Transaction options corresponding to PostgreSQL `SET TRANSACTION`
/// clauses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxOptions {
    /// `read only` or `read write` (case-insensitive). Defaults to
    /// `read write`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub access: String,

    /// `serializable`, `repeatable read` or `read committed`
    /// (case-insensitive). Defaults to `read committed`.
    #[serde(default, rename = "level", skip_serializing_if = "String::is_empty")]
    pub iso_level: String,

    /// Turns on the `DEFERRABLE` option for the transaction.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deferrable: bool,
}

impl TxOptions {
    /// Parsed access mode, defaulting to read-write.
    #[must_use]
    pub fn access_mode(&self) -> TxAccess {
        match self.access.to_lowercase().as_str() {
            "read only" => TxAccess::ReadOnly,
            _ => TxAccess::ReadWrite,
        }
    }

    /// Parsed isolation level, defaulting to read-committed.
    #[must_use]
    pub fn isolation(&self) -> TxIsolation {
        match self.iso_level.to_lowercase().as_str() {
            "serializable" => TxIsolation::Serializable,
            "repeatable read" => TxIsolation::RepeatableRead,
            _ => TxIsolation::ReadCommitted,
        }
    }
}

/// Transaction access modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxAccess {
    /// `READ ONLY`.
    ReadOnly,
    /// `READ WRITE`.
    ReadWrite,
}

/// Transaction isolation levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxIsolation {
    /// `READ COMMITTED`.
    ReadCommitted,
    /// `REPEATABLE READ`.
    RepeatableRead,
    /// `SERIALIZABLE`.
    Serializable,
}

/// A single endpoint parameter, passed via the URI path, the query string
/// or a form/JSON body. Failing any of the declared checks rejects the
/// request with HTTP 400.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Param {
    /// Parameter name; a C-like identifier. Required.
    pub name: String,

    /// Where the parameter is passed: `query`, `path` or `body`. A body
    /// parameter may arrive urlencoded or as a JSON object member.
    #[serde(rename = "in")]
    pub location: String,

    /// When true, an absent parameter fails the request; otherwise the
    /// SQL bind receives NULL.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,

    /// `integer`, `number`, `string`, `boolean` or `array`. Required.
    #[serde(rename = "type")]
    pub param_type: String,

    /// Allowed values, only for string/integer/number types. When present,
    /// the range and length checks below have no effect.
    #[serde(default, rename = "enum", skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<Value>,

    /// Minimum allowed value for integer/number types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,

    /// Maximum allowed value for integer/number types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,

    /// Maximum length for string values.
    #[serde(default, rename = "maxLength", skip_serializing_if = "Option::is_none")]
    pub max_length: Option<i64>,

    /// Regular expression for string values; anchored at both ends at
    /// compile time.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pattern: String,

    /// Minimum element count for array values.
    #[serde(default, rename = "minItems", skip_serializing_if = "Option::is_none")]
    pub min_items: Option<i64>,

    /// Maximum element count for array values.
    #[serde(default, rename = "maxItems", skip_serializing_if = "Option::is_none")]
    pub max_items: Option<i64>,

    /// Element type for array parameters; required for arrays, must be a
    /// scalar type (nested arrays are not allowed).
    #[serde(default, rename = "elemType", skip_serializing_if = "String::is_empty")]
    pub elem_type: String,
}

impl Param {
    /// Parsed parameter type.
    #[must_use]
    pub fn type_of(&self) -> Option<ParamType> {
        ParamType::parse(&self.param_type)
    }

    /// Parsed element type for arrays.
    #[must_use]
    pub fn elem_type_of(&self) -> Option<ParamType> {
        ParamType::parse(&self.elem_type)
    }

    /// Parsed parameter location.
    #[must_use]
    pub fn location_of(&self) -> Option<ParamLocation> {
        match self.location.as_str() {
            "path" => Some(ParamLocation::Path),
            "query" => Some(ParamLocation::Query),
            "body" => Some(ParamLocation::Body),
            _ => None,
        }
    }
}

/// Parameter value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    /// 64-bit signed integer.
    Integer,
    /// Double-precision float.
    Number,
    /// UTF-8 string.
    String,
    /// Boolean.
    Boolean,
    /// Homogeneous array of a scalar element type.
    Array,
}

impl ParamType {
    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "integer" => Some(Self::Integer),
            "number" => Some(Self::Number),
            "string" => Some(Self::String),
            "boolean" => Some(Self::Boolean),
            "array" => Some(Self::Array),
            _ => None,
        }
    }
}

/// Parameter locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamLocation {
    /// Router-extracted path component.
    Path,
    /// URL query string (multi-valued).
    Query,
    /// Form or JSON request body.
    Body,
}

/// An endpoint that a WebSocket or server-sent-events client connects to
/// in order to receive notifications sent on a PostgreSQL channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stream {
    /// Path of the stream. Same shape as the common prefix: no path
    /// variables.
    pub uri: String,

    /// `websocket` or `sse`. Required.
    #[serde(rename = "type")]
    pub stream_type: String,

    /// Name of the PostgreSQL NOTIFY channel. Required.
    pub channel: String,

    /// Datasource hosting the channel.
    pub datasource: String,

    /// Enables debug logging of all invocations of this stream.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub debug: bool,
}

impl Stream {
    /// Parsed transport kind.
    #[must_use]
    pub fn kind(&self) -> Option<StreamKind> {
        match self.stream_type.as_str() {
            "websocket" => Some(StreamKind::Websocket),
            "sse" => Some(StreamKind::Sse),
            _ => None,
        }
    }
}

/// Stream transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// WebSocket text messages, one per payload.
    Websocket,
    /// Server-sent events.
    Sse,
}

/// Cross-Origin Resource Sharing configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cors {
    /// Origins a cross-domain request may be executed from. `*` allows all
    /// origins; an origin may contain at most one `*` wildcard.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_origins: Vec<String>,

    /// Methods the client is allowed to use with cross-domain requests.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_methods: Vec<String>,

    /// Non-simple headers the client is allowed to use.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_headers: Vec<String>,

    /// Headers safe to expose to the CORS API of the browser.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exposed_headers: Vec<String>,

    /// Whether requests can include user credentials.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub allow_credentials: bool,

    /// How long (seconds) a preflight response may be cached. Ignored if
    /// <= 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<i64>,

    /// Enables logging of CORS decisions.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub debug: bool,
}

/// Connection parameters for one PostgreSQL database. The usual libpq
/// environment variables (PGHOST, PGPORT, PGUSER, PGPASSWORD, …) supply
/// defaults for omitted fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Datasource {
    /// Unique datasource name, in the shape of a fully qualified domain
    /// name. Examples: `prod-us-east-1`, `pgsrv03.acme.com`.
    pub name: String,

    /// IP, hostname or Unix socket path of the server, with an optional
    /// `:port` suffix overriding the default 5432.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,

    /// Database name. Defaults to the connecting user's name.
    #[serde(default, rename = "dbname", skip_serializing_if = "String::is_empty")]
    pub database: String,

    /// PostgreSQL user name to connect as.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,

    /// Plain-text password; prefer `passfile`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,

    /// Password file in libpq `~/.pgpass` format.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub passfile: String,

    /// One of `disable`, `allow`, `prefer`, `require`, `verify-ca`,
    /// `verify-full`.
    #[serde(default, rename = "sslmode", skip_serializing_if = "String::is_empty")]
    pub ssl_mode: String,

    /// Client SSL certificate file.
    #[serde(default, rename = "sslcert", skip_serializing_if = "String::is_empty")]
    pub ssl_cert: String,

    /// Secret key file for the client certificate.
    #[serde(default, rename = "sslkey", skip_serializing_if = "String::is_empty")]
    pub ssl_key: String,

    /// Certificate authority file used to verify the server certificate.
    #[serde(default, rename = "sslrootcert", skip_serializing_if = "String::is_empty")]
    pub ssl_root_cert: String,

    /// Additional connection parameters, like `application_name` or
    /// `search_path`.
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub params: std::collections::BTreeMap<String, String>,

    /// Prefer the simple query protocol (disables implicit prepared
    /// statements); useful behind connection poolers.
    #[serde(default, rename = "simple", skip_serializing_if = "std::ops::Not::not")]
    pub prefer_simple_protocol: bool,

    /// Timeout in seconds for establishing connections. Ignored if <= 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,

    /// PostgreSQL role set immediately upon connection.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,

    /// Connection pooling parameters. Without a pool block, connections
    /// are made as necessary without restraint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<ConnPool>,
}

/// Pooling settings for a single datasource. All fields are optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnPool {
    /// Minimum number of pooled connections. Must be > 0 when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_conns: Option<i64>,

    /// Maximum number of pooled connections. Defaults to
    /// max(4, number of CPUs). Must be > 0 when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_conns: Option<i64>,

    /// Seconds after which an idle connection is closed. Must be > 0 when
    /// present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_idle_time: Option<f64>,

    /// Seconds since creation after which a connection is closed. Must be
    /// > 0 when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connected_time: Option<f64>,

    /// Establish connections on first demand instead of at startup.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub lazy: bool,
}

/// A scheduled job: SQL statements executed on a datasource, or a script,
/// fired on a CRON schedule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Job {
    /// Unique job name, in the shape of a fully qualified domain name.
    /// Examples: `mkparts.daily`, `proj3-weekly-reports`.
    pub name: String,

    /// `exec` or `script`. For `exec`, `datasource` and `script` must be
    /// set; for `script`, the `script` field holds the source.
    #[serde(rename = "type")]
    pub job_type: String,

    /// Five-part CRON schedule, or a `@hourly`-style descriptor.
    /// Examples: `0 12 * * 1`, `23 0-20/2 * * *`.
    pub schedule: String,

    /// Datasource for `exec` jobs.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub datasource: String,

    /// SQL statements (`exec`) or script source (`script`). Required.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub script: String,

    /// Transaction options applied around `exec` jobs.
    #[serde(default, rename = "tx", skip_serializing_if = "Option::is_none")]
    pub tx_options: Option<TxOptions>,

    /// Enables debug logging of all invocations of this job.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub debug: bool,

    /// Timeout in seconds for the SQL statements of `exec` jobs. Ignored
    /// if <= 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
}

impl Job {
    /// Parsed job kind.
    #[must_use]
    pub fn kind(&self) -> Option<JobKind> {
        match self.job_type.as_str() {
            "exec" => Some(JobKind::Exec),
            "script" => Some(JobKind::Script),
            _ => None,
        }
    }
}

/// Job kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// SQL statements on a datasource.
    Exec,
    /// Script in the embedded sandbox.
    Script,
}
