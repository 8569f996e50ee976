//! Two-pass validation of the configuration document.
//!
//! The structural pass checks required fields and regex-matchable shapes;
//! the cross-reference pass checks name uniqueness and that every
//! datasource reference resolves. Findings are either fatal errors or
//! non-fatal warnings (values that will simply be ignored at runtime).

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::{ConfigError, ConfigResult};
use crate::model::{
    ConnPool, Cors, Datasource, Endpoint, Job, JobKind, Param, ParamType, ServerConfig, Stream,
    TxOptions,
};

/// Severity of a validation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The configuration is rejected.
    Error,
    /// The offending value is ignored at runtime.
    Warning,
}

/// One entry of the validation results.
#[derive(Debug, Clone)]
pub struct ValidationFinding {
    /// Whether this finding rejects the configuration.
    pub severity: Severity,
    /// Human-readable description of the finding.
    pub message: String,
}

impl ValidationFinding {
    fn error(message: String) -> Self {
        Self {
            severity: Severity::Error,
            message,
        }
    }

    fn warning(message: String) -> Self {
        Self {
            severity: Severity::Warning,
            message,
        }
    }

    /// Whether this finding is a warning.
    #[must_use]
    pub fn is_warning(&self) -> bool {
        self.severity == Severity::Warning
    }
}

static RX_PORT: Lazy<Regex> = Lazy::new(|| Regex::new(r":[0-9]+$").expect("port regex"));
static RX_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(/[A-Za-z0-9_.-]+)+$").expect("prefix regex"));
static RX_URI: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(/(\{[A-Za-z0-9_.-]+\}|[A-Za-z0-9_.-]+))+$").expect("uri regex"));
static RX_METHOD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^((GET)|(POST)|(PUT)|(PATCH)|(DELETE))$").expect("method regex"));
static RX_PARAM_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("param name regex"));
static RX_PG_IDENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_\u{80}-\u{FF}][A-Za-z0-9_$\u{80}-\u{FF}]*$").expect("pg ident regex")
});
static RX_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_-]*(\.[A-Za-z0-9_][A-Za-z0-9_-]*)*$").expect("name regex")
});
static RX_PG_PARAM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z]+(_[a-z]+)*$").expect("pg param regex"));

impl ServerConfig {
    /// Validate the entire configuration, returning every error and
    /// warning found.
    #[must_use]
    pub fn validate(&self) -> Vec<ValidationFinding> {
        let mut r = Vec::new();

        match canonical_version(&self.version) {
            None => r.push(ValidationFinding::error(format!(
                "invalid schema version {:?}: must be semver",
                self.version
            ))),
            Some(v) if v != semver::Version::new(1, 0, 0) => r.push(ValidationFinding::error(
                format!("incompatible schema version {:?}", self.version),
            )),
            Some(_) => {}
        }

        if !self.listen.is_empty() {
            if let Err(msg) = parse_listen(&self.listen) {
                r.push(ValidationFinding::error(msg));
            }
        }

        if !self.common_prefix.is_empty() && !RX_PREFIX.is_match(&self.common_prefix) {
            r.push(ValidationFinding::error(format!(
                "invalid common prefix {:?}",
                self.common_prefix
            )));
        }

        if let Some(cors) = &self.cors {
            validate_cors(cors, &mut r);
        }

        let mut ep_uris: HashMap<&str, usize> = HashMap::new();
        for ep in &self.endpoints {
            *ep_uris.entry(ep.uri.as_str()).or_default() += 1;
            validate_endpoint(ep, &self.datasources, &mut r);
        }
        for (uri, count) in &ep_uris {
            if *count > 1 {
                r.push(ValidationFinding::error(format!(
                    "{count} endpoints with same URI {uri:?}"
                )));
            }
        }

        let mut stream_uris: HashMap<&str, usize> = HashMap::new();
        for s in &self.streams {
            *stream_uris.entry(s.uri.as_str()).or_default() += 1;
            validate_stream(s, &self.datasources, &mut r);
        }
        for (uri, count) in &stream_uris {
            if *count > 1 {
                r.push(ValidationFinding::error(format!(
                    "{count} streams with same URI {uri:?}"
                )));
            }
        }
        for (uri, epc) in &ep_uris {
            if let Some(sc) = stream_uris.get(uri) {
                r.push(ValidationFinding::error(format!(
                    "{epc} endpoint and {sc} stream with same URI {uri:?}"
                )));
            }
        }

        let mut job_names: HashMap<&str, usize> = HashMap::new();
        for job in &self.jobs {
            *job_names.entry(job.name.as_str()).or_default() += 1;
            validate_job(job, &self.datasources, &mut r);
        }
        for (name, count) in &job_names {
            if *count > 1 {
                r.push(ValidationFinding::error(format!(
                    "{count} jobs named {name:?}"
                )));
            }
        }

        let mut ds_names: HashMap<&str, usize> = HashMap::new();
        for ds in &self.datasources {
            *ds_names.entry(ds.name.as_str()).or_default() += 1;
            validate_datasource(ds, &mut r);
        }
        for (name, count) in &ds_names {
            if *count > 1 {
                r.push(ValidationFinding::error(format!(
                    "{count} datasources named {name:?}"
                )));
            }
        }

        r
    }

    /// Validate and fail if at least one error finding is present. All
    /// error messages are joined into a single message; warnings are not
    /// included.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` when any error finding exists.
    pub fn ensure_valid(&self) -> ConfigResult<()> {
        let errors: Vec<String> = self
            .validate()
            .into_iter()
            .filter(|f| f.severity == Severity::Error)
            .map(|f| f.message)
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid {
                count: errors.len(),
                joined: errors.join("; "),
            })
        }
    }

    /// Socket address derived from the listen specifier (port 8080 and
    /// bind-all host when omitted).
    ///
    /// # Errors
    ///
    /// Returns an error if the listen specifier cannot be parsed.
    pub fn listen_socket_addr(&self) -> ConfigResult<SocketAddr> {
        listen_addr(&self.listen)
    }
}

/// Parse a listen specifier (`host:port` with both parts optional) into a
/// socket address. An empty host means bind-all; a missing port defaults
/// to 8080. Hosts must be IPv4 or bracketed IPv6 literals.
///
/// # Errors
///
/// Returns an error if the specifier does not parse.
pub fn listen_addr(listen: &str) -> ConfigResult<SocketAddr> {
    parse_listen(listen).map_err(|_| ConfigError::InvalidListen {
        value: listen.to_string(),
    })
}

fn parse_listen(listen: &str) -> Result<SocketAddr, String> {
    let mut spec = listen.to_string();
    if !RX_PORT.is_match(&spec) {
        spec.push_str(":8080");
    }

    let (host, port) = if let Some(rest) = spec.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| format!("invalid listen specification {listen:?}"))?;
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| format!("invalid listen specification {listen:?}"))?;
        (host, port)
    } else {
        match spec.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => (host, port),
            _ => return Err(format!("invalid listen specification {listen:?}")),
        }
    };

    let port_num = match port.parse::<u32>() {
        Ok(n) if (1..65_535).contains(&n) => u16::try_from(n).unwrap_or(8080),
        _ => {
            return Err(format!(
                "invalid listen specification: bad port {port:?}"
            ))
        }
    };

    let ip = if host.is_empty() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        host.parse::<IpAddr>()
            .map_err(|_| format!("invalid listen specification: bad IP {host:?}"))?
    };

    Ok(SocketAddr::new(ip, port_num))
}

fn canonical_version(version: &str) -> Option<semver::Version> {
    let v = version.trim();
    if v.is_empty() {
        return None;
    }
    let split_at = v.find(['-', '+']).unwrap_or(v.len());
    let (core, suffix) = v.split_at(split_at);
    let padded = match core.split('.').count() {
        1 => format!("{core}.0.0{suffix}"),
        2 => format!("{core}.0{suffix}"),
        _ => v.to_string(),
    };
    semver::Version::parse(&padded).ok()
}

fn validate_cors(cors: &Cors, r: &mut Vec<ValidationFinding>) {
    for origin in &cors.allowed_origins {
        if origin.matches('*').count() > 1 {
            r.push(ValidationFinding::error(format!(
                "cors: allowed origin {origin:?}: can use only 1 wildcard"
            )));
        }
    }
    for method in &cors.allowed_methods {
        if !RX_METHOD.is_match(method) {
            r.push(ValidationFinding::error(format!(
                "cors: allowed methods: invalid method {method:?}"
            )));
        }
    }
    if let Some(max_age) = cors.max_age {
        if max_age <= 0 {
            r.push(ValidationFinding::warning(format!(
                "cors: max age {max_age} is <=0, will be ignored"
            )));
        }
    }
}

fn validate_endpoint(ep: &Endpoint, ds: &[Datasource], r: &mut Vec<ValidationFinding>) {
    if !RX_URI.is_match(&ep.uri) && ep.uri != "/" {
        r.push(ValidationFinding::error(format!(
            "endpoint {:?}: invalid URI",
            ep.uri
        )));
    }

    for (i, method) in ep.methods.iter().enumerate() {
        if !RX_METHOD.is_match(method) {
            r.push(ValidationFinding::error(format!(
                "endpoint {:?}: method #{}: invalid method {method:?}",
                ep.uri,
                i + 1
            )));
        }
    }

    let mut param_names: HashMap<&str, usize> = HashMap::new();
    for p in &ep.params {
        *param_names.entry(p.name.as_str()).or_default() += 1;
        validate_param(p, &ep.uri, r);
    }
    for (name, count) in &param_names {
        if *count > 1 {
            r.push(ValidationFinding::error(format!(
                "endpoint {:?}: {count} params named {name:?}",
                ep.uri
            )));
        }
    }

    let kind = ep.kind();
    if kind.is_none() {
        r.push(ValidationFinding::error(format!(
            "endpoint {:?}: invalid implementation type {:?}",
            ep.uri, ep.impl_type
        )));
    }

    if kind.is_some_and(crate::model::ImplKind::is_sql)
        && !ds.iter().any(|d| d.name == ep.datasource)
    {
        r.push(ValidationFinding::error(format!(
            "endpoint {:?}: unknown datasource {:?}",
            ep.uri, ep.datasource
        )));
    }

    if ep.script.trim().is_empty() && ep.impl_type != "static-text" {
        r.push(ValidationFinding::error(format!(
            "endpoint {:?}: invalid script: empty",
            ep.uri
        )));
    }
    if ep.impl_type == "static-json" && serde_json::from_str::<Value>(&ep.script).is_err() {
        r.push(ValidationFinding::error(format!(
            "endpoint {:?}: invalid script: invalid json",
            ep.uri
        )));
    }

    if let Some(tx) = &ep.tx_options {
        validate_tx(tx, &format!("endpoint {:?}:", ep.uri), r);
    }

    if let Some(timeout) = ep.timeout {
        if timeout <= 0.0 {
            r.push(ValidationFinding::warning(format!(
                "endpoint {:?}: timeout {timeout} is <=0, will be ignored",
                ep.uri
            )));
        }
    }
    if let Some(cache) = ep.cache {
        if cache <= 0.0 {
            r.push(ValidationFinding::warning(format!(
                "endpoint {:?}: cache ttl {cache} is <=0, will be ignored",
                ep.uri
            )));
        }
    }
}

fn validate_tx(tx: &TxOptions, pfx: &str, r: &mut Vec<ValidationFinding>) {
    let access = tx.access.to_lowercase();
    if access != "read only" && access != "read write" && !access.is_empty() {
        r.push(ValidationFinding::error(format!(
            "{pfx} invalid access specifier {:?}",
            tx.access
        )));
    }
    let iso = tx.iso_level.to_lowercase();
    if iso != "read committed" && iso != "repeatable read" && iso != "serializable" && !iso.is_empty()
    {
        r.push(ValidationFinding::error(format!(
            "{pfx} invalid iso level {:?}",
            tx.iso_level
        )));
    }
}

fn validate_param(p: &Param, uri: &str, r: &mut Vec<ValidationFinding>) {
    let pfx = format!("endpoint {uri:?}: param {:?}:", p.name);

    if !RX_PARAM_NAME.is_match(&p.name) {
        r.push(ValidationFinding::error(format!("{pfx} invalid name")));
    }
    if p.location_of().is_none() {
        r.push(ValidationFinding::error(format!(
            "{pfx} invalid location {:?}",
            p.location
        )));
    }
    let ptype = p.type_of();
    if ptype.is_none() {
        r.push(ValidationFinding::error(format!(
            "{pfx} invalid type {:?}",
            p.param_type
        )));
    }
    if ptype == Some(ParamType::Array) && p.location == "path" {
        r.push(ValidationFinding::error(format!(
            "{pfx} type 'array' cannot occur in 'path'"
        )));
    }

    if !p.enum_values.is_empty() {
        if !matches!(
            ptype,
            Some(ParamType::Integer | ParamType::Number | ParamType::String)
        ) {
            r.push(ValidationFinding::error(format!(
                "{pfx} enum cannot be specified for parameter of type {:?}",
                p.param_type
            )));
        }
        for v in &p.enum_values {
            validate_enum_entry(v, ptype, &pfx, r);
        }
    }

    let is_numeric = matches!(ptype, Some(ParamType::Integer | ParamType::Number));
    if let Some(minimum) = p.minimum {
        if !is_numeric {
            r.push(ValidationFinding::error(format!(
                "{pfx} minimum can be specified only for params of type integer or number"
            )));
        }
        if ptype == Some(ParamType::Integer) && float_to_int(minimum).is_none() {
            r.push(ValidationFinding::error(format!(
                "{pfx} minimum {minimum} not a valid integer (has fractional part)"
            )));
        }
    }
    if let Some(maximum) = p.maximum {
        if !is_numeric {
            r.push(ValidationFinding::error(format!(
                "{pfx} maximum can be specified only for params of type integer or number"
            )));
        }
        if ptype == Some(ParamType::Integer) && float_to_int(maximum).is_none() {
            r.push(ValidationFinding::error(format!(
                "{pfx} maximum {maximum} not a valid integer (has fractional part)"
            )));
        }
        if let Some(minimum) = p.minimum {
            if maximum < minimum {
                r.push(ValidationFinding::error(format!(
                    "{pfx} maximum {maximum} is less than minimum {minimum}"
                )));
            }
        }
    }

    if let Some(max_length) = p.max_length {
        if ptype != Some(ParamType::String) {
            r.push(ValidationFinding::error(format!(
                "{pfx} maxLength can be specified only for params of type string"
            )));
        }
        if max_length < 0 {
            r.push(ValidationFinding::error(format!(
                "{pfx} maxLength {max_length} should be >= 0"
            )));
        }
    }
    if !p.pattern.is_empty() {
        if ptype != Some(ParamType::String) {
            r.push(ValidationFinding::error(format!(
                "{pfx} pattern can be specified only for params of type string"
            )));
        }
        if Regex::new(&format!("^{}$", p.pattern)).is_err() {
            r.push(ValidationFinding::error(format!(
                "{pfx} pattern is not a valid unanchored regex"
            )));
        }
    }

    if let Some(min_items) = p.min_items {
        if ptype != Some(ParamType::Array) {
            r.push(ValidationFinding::error(format!(
                "{pfx} minItems can be specified only for params of type array"
            )));
        }
        if min_items < 0 {
            r.push(ValidationFinding::error(format!(
                "{pfx} minItems {min_items} should be >= 0"
            )));
        }
    }
    if let Some(max_items) = p.max_items {
        if ptype != Some(ParamType::Array) {
            r.push(ValidationFinding::error(format!(
                "{pfx} maxItems can be specified only for params of type array"
            )));
        }
        if max_items < 0 {
            r.push(ValidationFinding::error(format!(
                "{pfx} maxItems {max_items} should be >= 0"
            )));
        }
        if let Some(min_items) = p.min_items {
            if max_items < min_items {
                r.push(ValidationFinding::error(format!(
                    "{pfx} maxItems {max_items} is less than minItems {min_items}"
                )));
            }
        }
    }

    if !p.elem_type.is_empty() && ptype != Some(ParamType::Array) {
        r.push(ValidationFinding::error(format!(
            "{pfx} elemType can be specified only for params of type array"
        )));
    }
    if p.elem_type.is_empty() && ptype == Some(ParamType::Array) {
        r.push(ValidationFinding::error(format!(
            "{pfx} elemType must be specified for params of type array"
        )));
    }
    if !p.elem_type.is_empty()
        && !matches!(
            p.elem_type_of(),
            Some(
                ParamType::Integer | ParamType::Number | ParamType::String | ParamType::Boolean
            )
        )
    {
        r.push(ValidationFinding::error(format!(
            "{pfx} elemType must be one of integer, number, string or boolean"
        )));
    }
}

fn validate_enum_entry(v: &Value, ptype: Option<ParamType>, pfx: &str, r: &mut Vec<ValidationFinding>) {
    match ptype {
        Some(ParamType::String) => {
            if !v.is_string() {
                r.push(ValidationFinding::error(format!(
                    "{pfx} enum entry '{v}': invalid string"
                )));
            }
        }
        Some(ParamType::Integer) => match v {
            Value::String(s) => {
                if string_to_int(s).is_none() {
                    r.push(ValidationFinding::error(format!(
                        "{pfx} enum entry {s:?}: not a valid integer"
                    )));
                }
            }
            Value::Number(n) => {
                if n.as_i64().is_none() {
                    if n.as_u64().is_some() {
                        r.push(ValidationFinding::error(format!(
                            "{pfx} enum entry '{v}': not a valid integer (value too large)"
                        )));
                    } else if n.as_f64().is_some_and(|f| float_to_int(f).is_none()) {
                        r.push(ValidationFinding::error(format!(
                            "{pfx} enum entry '{v}': not a valid integer (has fractional part)"
                        )));
                    }
                }
            }
            _ => r.push(ValidationFinding::error(format!(
                "{pfx} enum entry '{v}': not a valid integer"
            ))),
        },
        Some(ParamType::Number) => match v {
            Value::String(s) => {
                if s.parse::<f64>().is_err() {
                    r.push(ValidationFinding::error(format!(
                        "{pfx} enum entry {s:?}: not a valid number"
                    )));
                }
            }
            Value::Number(_) => {}
            _ => r.push(ValidationFinding::error(format!(
                "{pfx} enum entry '{v}': not a valid number"
            ))),
        },
        _ => {}
    }
}

fn validate_stream(s: &Stream, ds: &[Datasource], r: &mut Vec<ValidationFinding>) {
    // Note: unlike endpoint URIs, no path variables are allowed here.
    if !RX_PREFIX.is_match(&s.uri) && s.uri != "/" {
        r.push(ValidationFinding::error(format!(
            "stream {:?}: invalid URI",
            s.uri
        )));
    }
    if s.kind().is_none() {
        r.push(ValidationFinding::error(format!(
            "stream {:?}: invalid type {:?}",
            s.uri, s.stream_type
        )));
    }
    if !RX_PG_IDENT.is_match(&s.channel) {
        r.push(ValidationFinding::error(format!(
            "stream {:?}: invalid channel {:?}",
            s.uri, s.channel
        )));
    }
    if !ds.iter().any(|d| d.name == s.datasource) {
        r.push(ValidationFinding::error(format!(
            "stream {:?}: unknown datasource {:?}",
            s.uri, s.datasource
        )));
    }
}

fn validate_job(job: &Job, ds: &[Datasource], r: &mut Vec<ValidationFinding>) {
    if !RX_NAME.is_match(&job.name) {
        r.push(ValidationFinding::error(format!(
            "job {:?}: invalid name",
            job.name
        )));
    }
    if job.kind().is_none() {
        r.push(ValidationFinding::error(format!(
            "job {:?}: invalid type {:?}, must be one of 'exec' or 'script'",
            job.name, job.job_type
        )));
    }
    if let Err(err) = parse_cron_schedule(&job.schedule) {
        r.push(ValidationFinding::error(format!(
            "job {:?}: invalid cron schedule: {err}",
            job.name
        )));
    }
    if job.kind() == Some(JobKind::Exec) && !ds.iter().any(|d| d.name == job.datasource) {
        r.push(ValidationFinding::error(format!(
            "job {:?}: unknown datasource {:?}",
            job.name, job.datasource
        )));
    }
    if job.script.trim().is_empty() {
        r.push(ValidationFinding::error(format!(
            "job {:?}: invalid script: empty",
            job.name
        )));
    }
    if let Some(tx) = &job.tx_options {
        validate_tx(tx, &format!("job {:?}:", job.name), r);
    }
    if let Some(timeout) = job.timeout {
        if timeout <= 0.0 {
            r.push(ValidationFinding::warning(format!(
                "job {:?}: timeout {timeout} is <=0, will be ignored",
                job.name
            )));
        }
    }
}

fn validate_datasource(d: &Datasource, r: &mut Vec<ValidationFinding>) {
    if !RX_NAME.is_match(&d.name) {
        r.push(ValidationFinding::error(format!(
            "datasource {:?}: invalid name",
            d.name
        )));
    }
    for key in d.params.keys() {
        if !RX_PG_PARAM.is_match(key) {
            r.push(ValidationFinding::error(format!(
                "datasource {:?}: invalid param {key:?}",
                d.name
            )));
        }
    }
    if let Some(timeout) = d.timeout {
        if timeout <= 0.0 {
            r.push(ValidationFinding::warning(format!(
                "datasource {:?}: timeout {timeout} is <=0, will be ignored",
                d.name
            )));
        }
    }
    if !d.role.is_empty() && !RX_PG_IDENT.is_match(&d.role) {
        r.push(ValidationFinding::error(format!(
            "datasource {:?}: invalid role {:?}",
            d.name, d.role
        )));
    }
    for (field, path) in [
        ("sslcert", &d.ssl_cert),
        ("sslkey", &d.ssl_key),
        ("sslrootcert", &d.ssl_root_cert),
    ] {
        if !path.is_empty() && !file_exists(path) {
            r.push(ValidationFinding::error(format!(
                "datasource {:?}: {field} file {path:?} does not exist",
                d.name
            )));
        }
    }
    if let Some(pool) = &d.pool {
        validate_pool(pool, &d.name, r);
    }
}

fn validate_pool(p: &ConnPool, ds: &str, r: &mut Vec<ValidationFinding>) {
    if let Some(min) = p.min_conns {
        if min <= 0 {
            r.push(ValidationFinding::error(format!(
                "datasource {ds:?}: minConns for pool {min} must be >0"
            )));
        }
    }
    if let Some(max) = p.max_conns {
        if max <= 0 {
            r.push(ValidationFinding::error(format!(
                "datasource {ds:?}: maxConns for pool {max} must be >0"
            )));
        }
        if let Some(min) = p.min_conns {
            if max < min {
                r.push(ValidationFinding::error(format!(
                    "datasource {ds:?}: maxConns for pool {max} is < minConns {min}"
                )));
            }
        }
    }
    if let Some(idle) = p.max_idle_time {
        if idle <= 0.0 {
            r.push(ValidationFinding::error(format!(
                "datasource {ds:?}: maxIdleTime for pool {idle} must be > 0"
            )));
        }
    }
    if let Some(lifetime) = p.max_connected_time {
        if lifetime <= 0.0 {
            r.push(ValidationFinding::error(format!(
                "datasource {ds:?}: maxConnected for pool {lifetime} must be > 0"
            )));
        }
    }
}

fn file_exists(path: &str) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.is_file())
}

/// Convert a float to an integer, accepting a fractional part smaller than
/// 1e-9 as rounding noise.
#[must_use]
pub fn float_to_int(f: f64) -> Option<i64> {
    if !f.is_finite() {
        return None;
    }
    if f.fract().abs() < 1e-9 {
        #[allow(clippy::cast_possible_truncation)]
        Some(f.trunc() as i64)
    } else {
        None
    }
}

/// Convert a decimal string to an integer, accepting both `"200"` and
/// `"200.00"` forms.
#[must_use]
pub fn string_to_int(s: &str) -> Option<i64> {
    if let Ok(i) = s.parse::<i64>() {
        return Some(i);
    }
    s.parse::<f64>().ok().and_then(float_to_int)
}

/// Parse a cron schedule, normalising the standard 5-field form (a seconds
/// field is prefixed before handing it to the parser). Descriptor forms
/// such as `@hourly` pass through unchanged.
///
/// # Errors
///
/// Returns the parser error for malformed expressions.
pub fn parse_cron_schedule(expr: &str) -> Result<cron::Schedule, cron::error::Error> {
    let expr = expr.trim();
    let normalized = if !expr.starts_with('@') && expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    cron::Schedule::from_str(&normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ServerConfig {
        ServerConfig {
            version: "1.0.0".to_string(),
            ..ServerConfig::default()
        }
    }

    fn errors(cfg: &ServerConfig) -> Vec<String> {
        cfg.validate()
            .into_iter()
            .filter(|f| f.severity == Severity::Error)
            .map(|f| f.message)
            .collect()
    }

    #[test]
    fn version_shorthand_is_accepted() {
        for v in ["1", "1.0", "1.0.0"] {
            let mut cfg = base_config();
            cfg.version = v.to_string();
            assert!(errors(&cfg).is_empty(), "version {v} should be accepted");
        }
    }

    #[test]
    fn version_mismatch_is_rejected() {
        for v in ["", "x", "2", "1.1", "0.9.9", "1.0.0-rc1"] {
            let mut cfg = base_config();
            cfg.version = v.to_string();
            assert!(!errors(&cfg).is_empty(), "version {v} should be rejected");
        }
    }

    #[test]
    fn listen_specifiers_parse() {
        for (spec, expected) in [
            ("127.0.0.1:8000", "127.0.0.1:8000"),
            (":9000", "0.0.0.0:9000"),
            ("0.0.0.0:8080", "0.0.0.0:8080"),
            ("127.0.0.1", "127.0.0.1:8080"),
            ("[::1]:9090", "[::1]:9090"),
        ] {
            let addr = parse_listen(spec).expect("listen spec should parse");
            assert_eq!(addr.to_string(), expected, "spec {spec}");
        }
    }

    #[test]
    fn listen_specifiers_reject_bad_input() {
        for spec in ["example.com:80", ":0", ":65535", ":notaport", "[::1"] {
            assert!(parse_listen(spec).is_err(), "spec {spec} should fail");
        }
    }

    #[test]
    fn common_prefix_shape() {
        let mut cfg = base_config();
        cfg.common_prefix = "/api/v1".to_string();
        assert!(errors(&cfg).is_empty());

        cfg.common_prefix = "/api/".to_string();
        assert!(!errors(&cfg).is_empty());
    }

    fn endpoint(uri: &str, impl_type: &str) -> Endpoint {
        Endpoint {
            uri: uri.to_string(),
            impl_type: impl_type.to_string(),
            script: "select 1".to_string(),
            ..Endpoint::default()
        }
    }

    fn datasource(name: &str) -> Datasource {
        Datasource {
            name: name.to_string(),
            ..Datasource::default()
        }
    }

    #[test]
    fn endpoint_uri_and_kind_checks() {
        let mut cfg = base_config();
        cfg.datasources.push(datasource("main"));
        let mut ep = endpoint("/movies/{id}", "query-json");
        ep.datasource = "main".to_string();
        cfg.endpoints.push(ep);
        assert!(errors(&cfg).is_empty());

        cfg.endpoints[0].uri = "/bad uri".to_string();
        assert_eq!(errors(&cfg).len(), 1);

        cfg.endpoints[0].uri = "/ok".to_string();
        cfg.endpoints[0].impl_type = "bogus".to_string();
        assert_eq!(errors(&cfg).len(), 1);
    }

    #[test]
    fn endpoint_unknown_datasource_is_rejected() {
        let mut cfg = base_config();
        cfg.endpoints.push(endpoint("/q", "query-json"));
        let msgs = errors(&cfg);
        assert!(msgs.iter().any(|m| m.contains("unknown datasource")));
    }

    #[test]
    fn static_json_payload_must_be_json() {
        let mut cfg = base_config();
        let mut ep = endpoint("/info", "static-json");
        ep.script = "{not json".to_string();
        cfg.endpoints.push(ep);
        assert!(errors(&cfg)
            .iter()
            .any(|m| m.contains("invalid script: invalid json")));
    }

    #[test]
    fn duplicate_uris_are_rejected() {
        let mut cfg = base_config();
        cfg.endpoints.push(endpoint("/a", "static-text"));
        cfg.endpoints.push(endpoint("/a", "static-text"));
        assert!(errors(&cfg)
            .iter()
            .any(|m| m.contains("endpoints with same URI")));

        let mut cfg = base_config();
        cfg.datasources.push(datasource("main"));
        cfg.endpoints.push(endpoint("/a", "static-text"));
        cfg.streams.push(Stream {
            uri: "/a".to_string(),
            stream_type: "sse".to_string(),
            channel: "chan".to_string(),
            datasource: "main".to_string(),
            debug: false,
        });
        assert!(errors(&cfg)
            .iter()
            .any(|m| m.contains("endpoint and 1 stream with same URI")));
    }

    fn param(name: &str, location: &str, ptype: &str) -> Param {
        Param {
            name: name.to_string(),
            location: location.to_string(),
            param_type: ptype.to_string(),
            ..Param::default()
        }
    }

    #[test]
    fn param_array_in_path_is_rejected() {
        let mut cfg = base_config();
        let mut ep = endpoint("/a", "static-text");
        let mut p = param("xs", "path", "array");
        p.elem_type = "integer".to_string();
        ep.params.push(p);
        cfg.endpoints.push(ep);
        assert!(errors(&cfg)
            .iter()
            .any(|m| m.contains("type 'array' cannot occur in 'path'")));
    }

    #[test]
    fn param_bounds_cross_checks() {
        let mut cfg = base_config();
        let mut ep = endpoint("/a", "static-text");
        let mut p = param("n", "query", "integer");
        p.minimum = Some(10.0);
        p.maximum = Some(5.0);
        ep.params.push(p);
        cfg.endpoints.push(ep);
        assert!(errors(&cfg)
            .iter()
            .any(|m| m.contains("maximum 5 is less than minimum 10")));
    }

    #[test]
    fn param_integer_enum_entries() {
        let mut cfg = base_config();
        let mut ep = endpoint("/a", "static-text");
        let mut p = param("n", "query", "integer");
        p.enum_values = vec![
            serde_json::json!(3),
            serde_json::json!(4.0),
            serde_json::json!("5"),
            serde_json::json!("6.00"),
        ];
        ep.params.push(p.clone());
        cfg.endpoints.push(ep);
        assert!(errors(&cfg).is_empty());

        let mut cfg = base_config();
        let mut ep = endpoint("/a", "static-text");
        p.enum_values = vec![serde_json::json!(4.5)];
        ep.params.push(p);
        cfg.endpoints.push(ep);
        assert!(errors(&cfg)
            .iter()
            .any(|m| m.contains("has fractional part")));
    }

    #[test]
    fn param_pattern_must_compile() {
        let mut cfg = base_config();
        let mut ep = endpoint("/a", "static-text");
        let mut p = param("s", "query", "string");
        p.pattern = "[unclosed".to_string();
        ep.params.push(p);
        cfg.endpoints.push(ep);
        assert!(errors(&cfg)
            .iter()
            .any(|m| m.contains("not a valid unanchored regex")));
    }

    #[test]
    fn param_array_requires_elem_type() {
        let mut cfg = base_config();
        let mut ep = endpoint("/a", "static-text");
        ep.params.push(param("xs", "query", "array"));
        cfg.endpoints.push(ep);
        assert!(errors(&cfg)
            .iter()
            .any(|m| m.contains("elemType must be specified")));
    }

    #[test]
    fn stream_channel_shape() {
        let mut cfg = base_config();
        cfg.datasources.push(datasource("main"));
        let mut stream = Stream {
            uri: "/sse".to_string(),
            stream_type: "sse".to_string(),
            channel: "chansse".to_string(),
            datasource: "main".to_string(),
            debug: false,
        };
        cfg.streams.push(stream.clone());
        assert!(errors(&cfg).is_empty());

        stream.channel = "9bad".to_string();
        cfg.streams[0] = stream;
        assert!(errors(&cfg).iter().any(|m| m.contains("invalid channel")));
    }

    #[test]
    fn job_checks() {
        let mut cfg = base_config();
        cfg.datasources.push(datasource("main"));
        let job = Job {
            name: "nightly.cleanup".to_string(),
            job_type: "exec".to_string(),
            schedule: "0 12 * * 1".to_string(),
            datasource: "main".to_string(),
            script: "delete from t".to_string(),
            ..Job::default()
        };
        cfg.jobs.push(job.clone());
        assert!(errors(&cfg).is_empty());

        cfg.jobs[0].schedule = "not a schedule".to_string();
        assert!(errors(&cfg)
            .iter()
            .any(|m| m.contains("invalid cron schedule")));

        cfg.jobs[0] = job;
        cfg.jobs[0].datasource = "nope".to_string();
        assert!(errors(&cfg).iter().any(|m| m.contains("unknown datasource")));
    }

    #[test]
    fn datasource_pool_checks() {
        let mut cfg = base_config();
        let mut ds = datasource("main");
        ds.pool = Some(ConnPool {
            min_conns: Some(4),
            max_conns: Some(2),
            ..ConnPool::default()
        });
        cfg.datasources.push(ds);
        assert!(errors(&cfg)
            .iter()
            .any(|m| m.contains("maxConns for pool 2 is < minConns 4")));
    }

    #[test]
    fn negative_timeouts_warn_but_pass() {
        let mut cfg = base_config();
        let mut ds = datasource("main");
        ds.timeout = Some(-1.0);
        cfg.datasources.push(ds);
        let findings = cfg.validate();
        assert!(findings.iter().all(ValidationFinding::is_warning));
        assert!(cfg.ensure_valid().is_ok());
    }

    #[test]
    fn float_to_int_tolerance() {
        assert_eq!(float_to_int(2000.0), Some(2000));
        assert_eq!(float_to_int(2000.000_000_000_1), Some(2000));
        assert_eq!(float_to_int(1999.999), None);
        assert_eq!(float_to_int(f64::NAN), None);
        assert_eq!(float_to_int(f64::INFINITY), None);
    }

    #[test]
    fn cron_five_field_form_is_normalised() {
        assert!(parse_cron_schedule("0 12 * * 1").is_ok());
        assert!(parse_cron_schedule("23 0-20/2 * * *").is_ok());
        assert!(parse_cron_schedule("@hourly").is_ok());
        assert!(parse_cron_schedule("every day").is_err());
    }
}
