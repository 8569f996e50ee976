//! Per-datasource connection pools and acquisition wrappers.
//!
//! Startup is sequential across sources; the first connection failure of a
//! non-lazy source closes the pools opened so far and aborts. Acquisition
//! offers plain pooled access, transaction-wrapped access honouring the
//! configured access mode / isolation / deferrable flag, caller-owned
//! connections for script use, and a dedicated LISTEN connection per
//! source for the notification fan-out.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use sqlx::postgres::{
    PgConnectOptions, PgListener, PgPool, PgPoolOptions, PgSslMode,
};
use sqlx::pool::PoolConnection;
use sqlx::{Executor, PgConnection, Postgres};
use tracing::{error, info};

use rowgate_config::{Datasource, TxAccess, TxIsolation, TxOptions};

use crate::error::{DataError, Result};
use crate::row::row_values;
use crate::value::{bind_args, ArgValue};

struct Source {
    pool: PgPool,
    timeout: Option<Duration>,
    simple: bool,
}

/// Manager of all configured datasources, keyed by name. Read-only after
/// startup.
pub struct DataSources {
    sources: HashMap<String, Source>,
}

impl DataSources {
    /// Connect to every datasource in order. Lazy sources defer their
    /// first connection to first use.
    ///
    /// # Errors
    ///
    /// Returns the first connection failure; pools opened before the
    /// failure are closed again.
    pub async fn connect(configs: &[Datasource]) -> Result<Self> {
        let mut sources = HashMap::new();
        for cfg in configs {
            match connect_source(cfg).await {
                Ok(source) => {
                    info!(datasource = %cfg.name, "successfully connected to datasource");
                    sources.insert(cfg.name.clone(), source);
                }
                Err(err) => {
                    error!(datasource = %cfg.name, error = %err, "failed to connect to datasource");
                    for source in sources.values() {
                        source.pool.close().await;
                    }
                    return Err(err);
                }
            }
        }
        Ok(Self { sources })
    }

    fn source(&self, name: &str) -> Result<&Source> {
        self.sources.get(name).ok_or_else(|| DataError::UnknownSource {
            name: name.to_string(),
        })
    }

    /// Whether a datasource with this name exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    /// Whether the named source prefers the simple query protocol.
    #[must_use]
    pub fn prefers_simple(&self, name: &str) -> bool {
        self.sources.get(name).is_some_and(|s| s.simple)
    }

    /// Run a query, optionally inside a transaction, and collect all rows
    /// as JSON values. `op_timeout` bounds the whole operation.
    ///
    /// # Errors
    ///
    /// Returns an error if acquisition, the transaction, the query or row
    /// decoding fails, or the deadline elapses.
    pub fn query<'a>(
        &'a self,
        name: &'a str,
        tx_options: Option<&'a TxOptions>,
        op_timeout: Option<Duration>,
        sql: &'a str,
        args: &'a [ArgValue],
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<Vec<Value>>>> + Send + 'a>>
    {
        Box::pin(async move {
            let source = self.source(name)?;
            match op_timeout.filter(|d| !d.is_zero()) {
                Some(deadline) => tokio::time::timeout(deadline, async move {
                    let mut conn = acquire_from(source, name, None).await?;
                    match tx_options {
                        Some(opts) => {
                            tx_begin(&mut conn, opts).await?;
                            let result = query_on(&mut conn, sql, args, !source.simple).await;
                            tx_finish(&mut conn, result).await
                        }
                        None => query_on(&mut conn, sql, args, !source.simple).await,
                    }
                })
                .await
                .map_err(|_| DataError::Timeout)?,
                None => {
                    let mut conn = acquire_from(source, name, None).await?;
                    match tx_options {
                        Some(opts) => {
                            tx_begin(&mut conn, opts).await?;
                            let result = query_on(&mut conn, sql, args, !source.simple).await;
                            tx_finish(&mut conn, result).await
                        }
                        None => query_on(&mut conn, sql, args, !source.simple).await,
                    }
                }
            }
        })
    }

    /// Execute a statement, optionally inside a transaction, returning
    /// the affected row count. Without bind arguments the SQL may contain
    /// multiple statements.
    ///
    /// # Errors
    ///
    /// Returns an error if acquisition, the transaction or the statement
    /// fails, or the deadline elapses.
    pub fn execute<'a>(
        &'a self,
        name: &'a str,
        tx_options: Option<&'a TxOptions>,
        op_timeout: Option<Duration>,
        sql: &'a str,
        args: &'a [ArgValue],
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<u64>> + Send + 'a>> {
        Box::pin(async move {
            let source = self.source(name)?;
            match op_timeout.filter(|d| !d.is_zero()) {
                Some(deadline) => tokio::time::timeout(deadline, async move {
                    let mut conn = acquire_from(source, name, None).await?;
                    match tx_options {
                        Some(opts) => {
                            tx_begin(&mut conn, opts).await?;
                            let result = execute_on(&mut conn, sql, args, !source.simple).await;
                            tx_finish(&mut conn, result).await
                        }
                        None => execute_on(&mut conn, sql, args, !source.simple).await,
                    }
                })
                .await
                .map_err(|_| DataError::Timeout)?,
                None => {
                    let mut conn = acquire_from(source, name, None).await?;
                    match tx_options {
                        Some(opts) => {
                            tx_begin(&mut conn, opts).await?;
                            let result = execute_on(&mut conn, sql, args, !source.simple).await;
                            tx_finish(&mut conn, result).await
                        }
                        None => execute_on(&mut conn, sql, args, !source.simple).await,
                    }
                }
            }
        })
    }

    /// Check a connection out of the pool for a script-level caller. An
    /// explicit positive timeout overrides the source's configured one.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown sources or acquisition failures.
    pub async fn acquire(
        &self,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<PoolConnection<Postgres>> {
        let source = self.source(name)?;
        acquire_from(source, name, timeout).await
    }

    /// Open a dedicated LISTEN connection against the named source. The
    /// connection lives outside the pool's accounting for as long as the
    /// caller holds it.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown sources or connection failures.
    pub async fn listener(&self, name: &str) -> Result<PgListener> {
        let source = self.source(name)?;
        PgListener::connect_with(&source.pool)
            .await
            .map_err(|source| DataError::Acquire {
                name: name.to_string(),
                source,
            })
    }

    /// Close all pools.
    pub async fn close(&self) {
        for (name, source) in &self.sources {
            source.pool.close().await;
            info!(datasource = %name, "datasource connection pool closed");
        }
    }
}

async fn acquire_from(
    source: &Source,
    name: &str,
    timeout: Option<Duration>,
) -> Result<PoolConnection<Postgres>> {
    let effective = timeout.filter(|d| !d.is_zero()).or(source.timeout);
    let acquire = source.pool.acquire();
    let result = match effective {
        Some(deadline) => tokio::time::timeout(deadline, acquire)
            .await
            .map_err(|_| DataError::Timeout)?,
        None => acquire.await,
    };
    result.map_err(|source| DataError::Acquire {
        name: name.to_string(),
        source,
    })
}

async fn with_deadline<T>(
    op_timeout: Option<Duration>,
    fut: impl std::future::Future<Output = Result<T>> + Send,
) -> Result<T> {
    match op_timeout.filter(|d| !d.is_zero()) {
        Some(deadline) => tokio::time::timeout(deadline, fut)
            .await
            .map_err(|_| DataError::Timeout)?,
        None => fut.await,
    }
}

async fn tx_begin(conn: &mut PgConnection, opts: &TxOptions) -> Result<()> {
    conn.execute("BEGIN").await.map_err(DataError::query)?;
    let stmt = set_transaction_sql(opts);
    if let Err(err) = conn.execute(stmt.as_str()).await {
        let _ = conn.execute("ROLLBACK").await;
        return Err(DataError::query(err));
    }
    Ok(())
}

async fn tx_finish<T>(conn: &mut PgConnection, result: Result<T>) -> Result<T> {
    match result {
        Ok(out) => {
            conn.execute("COMMIT").await.map_err(DataError::query)?;
            Ok(out)
        }
        Err(err) => {
            let _ = conn.execute("ROLLBACK").await;
            Err(err)
        }
    }
}

/// Run a query on an already-acquired connection and collect the result
/// set as JSON values.
///
/// # Errors
///
/// Returns an error if the query or row decoding fails.
pub async fn query_on(
    conn: &mut PgConnection,
    sql: &str,
    args: &[ArgValue],
    persistent: bool,
) -> Result<Vec<Vec<Value>>> {
    let query = bind_args(sqlx::query(sql), args).persistent(persistent);
    let rows = query.fetch_all(conn).await.map_err(DataError::query)?;
    rows.iter().map(row_values).collect()
}

/// Execute a statement on an already-acquired connection. Without bind
/// arguments the SQL may contain multiple statements.
///
/// # Errors
///
/// Returns an error if the statement fails.
pub async fn execute_on(
    conn: &mut PgConnection,
    sql: &str,
    args: &[ArgValue],
    persistent: bool,
) -> Result<u64> {
    let result = if args.is_empty() {
        sqlx::raw_sql(sql).execute(conn).await.map_err(DataError::query)?
    } else {
        bind_args(sqlx::query(sql), args)
            .persistent(persistent)
            .execute(conn)
            .await
            .map_err(DataError::query)?
    };
    Ok(result.rows_affected())
}

/// Render the `SET TRANSACTION` statement for the configured options.
#[must_use]
pub fn set_transaction_sql(opts: &TxOptions) -> String {
    let mut sql = String::from("SET TRANSACTION ISOLATION LEVEL ");
    sql.push_str(match opts.isolation() {
        TxIsolation::ReadCommitted => "READ COMMITTED",
        TxIsolation::RepeatableRead => "REPEATABLE READ",
        TxIsolation::Serializable => "SERIALIZABLE",
    });
    sql.push_str(match opts.access_mode() {
        TxAccess::ReadOnly => " READ ONLY",
        TxAccess::ReadWrite => " READ WRITE",
    });
    if opts.deferrable {
        sql.push_str(" DEFERRABLE");
    }
    sql
}

async fn connect_source(cfg: &Datasource) -> Result<Source> {
    let connect = connect_options(cfg);
    let timeout = cfg
        .timeout
        .filter(|t| *t > 0.0)
        .map(Duration::from_secs_f64);

    let mut pool_opts = PgPoolOptions::new().max_connections(default_max_conns());
    if let Some(pool) = &cfg.pool {
        if let Some(min) = pool.min_conns.filter(|v| *v > 0) {
            pool_opts = pool_opts.min_connections(u32::try_from(min).unwrap_or(u32::MAX));
        }
        if let Some(max) = pool.max_conns.filter(|v| *v > 0) {
            pool_opts = pool_opts.max_connections(u32::try_from(max).unwrap_or(u32::MAX));
        }
        if let Some(idle) = pool.max_idle_time.filter(|v| *v > 0.0) {
            pool_opts = pool_opts.idle_timeout(Some(Duration::from_secs_f64(idle)));
        }
        if let Some(lifetime) = pool.max_connected_time.filter(|v| *v > 0.0) {
            pool_opts = pool_opts.max_lifetime(Some(Duration::from_secs_f64(lifetime)));
        }
    }
    if let Some(t) = timeout {
        pool_opts = pool_opts.acquire_timeout(t);
    }
    if !cfg.role.is_empty() {
        // SET ROLE takes no bind parameter; the role name was validated
        // against the PostgreSQL identifier shape.
        let role = cfg.role.clone();
        pool_opts = pool_opts.after_connect(move |conn, _meta| {
            let role = role.clone();
            Box::pin(async move {
                let stmt = format!("SET ROLE {role}");
                conn.execute(stmt.as_str()).await?;
                Ok(())
            })
        });
    }

    let lazy = cfg.pool.as_ref().is_some_and(|p| p.lazy);
    let pool = if lazy {
        pool_opts.connect_lazy_with(connect)
    } else {
        let connecting = pool_opts.connect_with(connect);
        let connected = match timeout {
            Some(t) => tokio::time::timeout(t, connecting)
                .await
                .map_err(|_| DataError::Timeout)?,
            None => connecting.await,
        };
        connected.map_err(|source| DataError::Connect {
            name: cfg.name.clone(),
            source,
        })?
    };

    Ok(Source {
        pool,
        timeout,
        simple: cfg.prefer_simple_protocol,
    })
}

fn default_max_conns() -> u32 {
    let cpus = std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get);
    u32::try_from(cpus.max(4)).unwrap_or(4)
}

fn connect_options(cfg: &Datasource) -> PgConnectOptions {
    // PgConnectOptions::new() picks up the libpq environment defaults
    // (PGHOST, PGPORT, PGUSER, PGPASSWORD, ...).
    let mut opts = PgConnectOptions::new();

    let mut host = String::new();
    let mut port: Option<u16> = None;
    if !cfg.host.is_empty() {
        let first = cfg.host.split(',').next().unwrap_or(&cfg.host);
        match first.rsplit_once(':') {
            Some((h, p)) if p.parse::<u16>().is_ok() => {
                host = h.to_string();
                port = p.parse::<u16>().ok();
            }
            _ => host = first.to_string(),
        }
        opts = opts.host(&host);
        if let Some(p) = port {
            opts = opts.port(p);
        }
    }
    if !cfg.database.is_empty() {
        opts = opts.database(&cfg.database);
    }
    if !cfg.user.is_empty() {
        opts = opts.username(&cfg.user);
    }
    if !cfg.password.is_empty() {
        opts = opts.password(&cfg.password);
    } else if !cfg.passfile.is_empty() {
        if let Some(password) = passfile_lookup(
            Path::new(&cfg.passfile),
            &host,
            port.unwrap_or(5432),
            &cfg.database,
            &cfg.user,
        ) {
            opts = opts.password(&password);
        }
    }
    if !cfg.ssl_mode.is_empty() {
        if let Ok(mode) = cfg.ssl_mode.parse::<PgSslMode>() {
            opts = opts.ssl_mode(mode);
        }
    }
    if !cfg.ssl_cert.is_empty() {
        opts = opts.ssl_client_cert(&cfg.ssl_cert);
    }
    if !cfg.ssl_key.is_empty() {
        opts = opts.ssl_client_key(&cfg.ssl_key);
    }
    if !cfg.ssl_root_cert.is_empty() {
        opts = opts.ssl_root_cert(&cfg.ssl_root_cert);
    }
    if let Some(app_name) = cfg.params.get("application_name") {
        opts = opts.application_name(app_name);
    }
    let extra: Vec<(&str, &str)> = cfg
        .params
        .iter()
        .filter(|(k, _)| k.as_str() != "application_name")
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    if !extra.is_empty() {
        opts = opts.options(extra);
    }
    if cfg.prefer_simple_protocol {
        opts = opts.statement_cache_capacity(0);
    }
    opts
}

fn passfile_lookup(path: &Path, host: &str, port: u16, db: &str, user: &str) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    let port = port.to_string();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.splitn(5, ':').collect();
        if fields.len() != 5 {
            continue;
        }
        let matches = |field: &str, value: &str| field == "*" || field == value;
        if matches(fields[0], host)
            && matches(fields[1], &port)
            && matches(fields[2], db)
            && matches(fields[3], user)
        {
            return Some(fields[4].to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn transaction_sql_covers_all_options() {
        let tx = TxOptions::default();
        assert_eq!(
            set_transaction_sql(&tx),
            "SET TRANSACTION ISOLATION LEVEL READ COMMITTED READ WRITE"
        );

        let tx = TxOptions {
            access: "Read Only".to_string(),
            iso_level: "Serializable".to_string(),
            deferrable: true,
        };
        assert_eq!(
            set_transaction_sql(&tx),
            "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE READ ONLY DEFERRABLE"
        );

        let tx = TxOptions {
            access: String::new(),
            iso_level: "repeatable read".to_string(),
            deferrable: false,
        };
        assert_eq!(
            set_transaction_sql(&tx),
            "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ WRITE"
        );
    }

    #[test]
    fn passfile_matching_honours_wildcards() {
        let mut file = tempfile_with(
            "# comment\n\
             localhost:5432:appdb:alice:secret1\n\
             *:*:*:bob:secret2\n",
        );
        file.flush().expect("flush");
        let path = file.path().to_path_buf();

        assert_eq!(
            passfile_lookup(&path, "localhost", 5432, "appdb", "alice"),
            Some("secret1".to_string())
        );
        assert_eq!(
            passfile_lookup(&path, "elsewhere", 5433, "other", "bob"),
            Some("secret2".to_string())
        );
        assert_eq!(passfile_lookup(&path, "localhost", 5432, "appdb", "carol"), None);
    }

    fn tempfile_with(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(contents.as_bytes()).expect("write");
        file
    }

    #[tokio::test]
    async fn unknown_source_is_reported() {
        let sources = DataSources {
            sources: HashMap::new(),
        };
        let err = sources.acquire("nope", None).await.unwrap_err();
        assert!(matches!(err, DataError::UnknownSource { .. }));
        assert_eq!(err.to_string(), "datasource \"nope\" not found");
    }
}
