//! The `$sys` sandbox: context setup, native callables and outcome
//! classification.

use std::cell::RefCell;
use std::sync::Arc;
use std::time::Duration;

use boa_engine::object::ObjectInitializer;
use boa_engine::property::Attribute;
use boa_engine::{
    js_string, Context, JsError, JsNativeError, JsResult, JsValue, NativeFunction, Source,
};
use serde_json::{json, Map, Value};
use sqlx::pool::PoolConnection;
use sqlx::Postgres;
use tokio::runtime::Handle;
use tracing::debug;

use rowgate_data::manager::{execute_on, query_on};
use rowgate_data::{ArgValue, DataSources, NullKind};

/// Optional embedder hook run against each fresh context before
/// evaluation, to register extra host functions.
pub type InitHook = Arc<dyn Fn(&mut Context) + Send + Sync>;

/// Classified value read back from the sandbox after evaluation: either
/// `$sys.result`, or the thrown value when the script failed.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    /// Undefined or null; nothing usable was produced.
    Missing,
    /// A string.
    Text(String),
    /// A non-array object, rendered to JSON.
    Object(Value),
    /// An array, rendered to JSON. Arrays are not a supported result
    /// shape.
    Array(Value),
    /// Anything else (numbers, booleans, functions, ...).
    Other,
}

/// Result of one script evaluation.
#[derive(Debug, Clone)]
pub struct ScriptOutcome {
    /// The classified result (or thrown) value.
    pub value: ScriptValue,
    /// The failure message when the script threw.
    pub error: Option<String>,
}

/// Evaluates scripts against the configured datasources.
pub struct ScriptHost {
    datasources: Arc<DataSources>,
    init_context: Option<InitHook>,
}

impl ScriptHost {
    /// Create a host bound to the given datasources. `init_context`, when
    /// present, runs against every fresh sandbox.
    #[must_use]
    pub fn new(datasources: Arc<DataSources>, init_context: Option<InitHook>) -> Self {
        Self {
            datasources,
            init_context,
        }
    }

    /// Evaluate a script with the given parameter map. Never fails at the
    /// host level; script failures are reported through the outcome.
    pub async fn run(
        &self,
        source: &str,
        params: Map<String, Value>,
        debug: bool,
    ) -> ScriptOutcome {
        let state = Sandbox {
            datasources: Arc::clone(&self.datasources),
            handle: Handle::current(),
            conns: Vec::new(),
            debug,
        };
        let source = source.to_string();
        let init = self.init_context.clone();
        let joined =
            tokio::task::spawn_blocking(move || evaluate(state, &source, &params, init.as_ref()))
                .await;
        joined.unwrap_or_else(|err| ScriptOutcome {
            value: ScriptValue::Missing,
            error: Some(format!("script host failure: {err}")),
        })
    }
}

struct Sandbox {
    datasources: Arc<DataSources>,
    handle: Handle,
    conns: Vec<HeldConn>,
    debug: bool,
}

struct HeldConn {
    conn: PoolConnection<Postgres>,
    persistent: bool,
}

thread_local! {
    static SANDBOX: RefCell<Option<Sandbox>> = const { RefCell::new(None) };
}

fn evaluate(
    state: Sandbox,
    source: &str,
    params: &Map<String, Value>,
    init: Option<&InitHook>,
) -> ScriptOutcome {
    SANDBOX.with(|slot| *slot.borrow_mut() = Some(state));
    let outcome = evaluate_inner(source, params, init);
    // Tear the sandbox down regardless of outcome; dropping the held
    // connections returns them to their pools.
    SANDBOX.with(|slot| slot.borrow_mut().take());
    outcome
}

fn evaluate_inner(
    source: &str,
    params: &Map<String, Value>,
    init: Option<&InitHook>,
) -> ScriptOutcome {
    let mut context = Context::default();

    let params_value = Value::Object(params.clone());
    let params_js = match JsValue::from_json(&params_value, &mut context) {
        Ok(v) => v,
        Err(err) => return host_failure(format!("failed to build $sys.params: {err}")),
    };

    let sys = ObjectInitializer::new(&mut context)
        .property(js_string!("params"), params_js, Attribute::all())
        .function(
            NativeFunction::from_fn_ptr(sys_acquire),
            js_string!("acquire"),
            1,
        )
        .build();

    if let Err(err) =
        context.register_global_property(js_string!("$sys"), sys.clone(), Attribute::all())
    {
        return host_failure(format!("failed to install $sys: {err}"));
    }

    if let Some(init) = init {
        init(&mut context);
    }

    match context.eval(Source::from_bytes(source)) {
        Ok(_) => {
            let result = sys
                .get(js_string!("result"), &mut context)
                .unwrap_or(JsValue::undefined());
            ScriptOutcome {
                value: classify_value(&result, &mut context),
                error: None,
            }
        }
        Err(err) => classify_error(&err, &mut context),
    }
}

fn host_failure(message: String) -> ScriptOutcome {
    ScriptOutcome {
        value: ScriptValue::Missing,
        error: Some(message),
    }
}

fn classify_value(value: &JsValue, context: &mut Context) -> ScriptValue {
    if value.is_undefined() || value.is_null() {
        return ScriptValue::Missing;
    }
    if let Some(s) = value.as_string() {
        return ScriptValue::Text(s.to_std_string_escaped());
    }
    if value.is_object() {
        return match value.to_json(context) {
            Ok(v @ Value::Array(_)) => ScriptValue::Array(v),
            Ok(v @ Value::Object(_)) => ScriptValue::Object(v),
            _ => ScriptValue::Other,
        };
    }
    ScriptValue::Other
}

fn classify_error(err: &JsError, context: &mut Context) -> ScriptOutcome {
    // A thrown value (`throw 'foo'`, `throw {...}`) surfaces as an opaque
    // JsValue; host throws and engine errors carry a kind and message.
    if let Some(opaque) = err.as_opaque() {
        let value = classify_value(opaque, context);
        let message = match &value {
            ScriptValue::Text(s) => s.clone(),
            ScriptValue::Object(v) | ScriptValue::Array(v) => v.to_string(),
            _ => err.to_string(),
        };
        let message = if message.is_empty() {
            "script error".to_string()
        } else {
            message
        };
        return ScriptOutcome {
            value,
            error: Some(message),
        };
    }

    let message = match err.clone().try_native(context) {
        Ok(native) => native.to_string(),
        Err(_) => err.to_string(),
    };
    let message = if message.is_empty() {
        "script error".to_string()
    } else {
        message
    };
    ScriptOutcome {
        value: ScriptValue::Object(json!({ "Message": message })),
        error: Some(message),
    }
}

fn throw(message: &str) -> JsError {
    JsNativeError::error().with_message(message).into()
}

fn with_sandbox<T>(f: impl FnOnce(&mut Sandbox) -> T) -> JsResult<T> {
    SANDBOX.with(|slot| {
        let mut slot = slot.borrow_mut();
        slot.as_mut()
            .map(f)
            .ok_or_else(|| throw("script host is not active"))
    })
}

fn sys_acquire(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    if args.len() != 1 && args.len() != 2 {
        return Err(throw("$sys.acquire: needs 1 or 2 arguments"));
    }

    let Some(name) = args[0].as_string().map(|s| s.to_std_string_escaped()) else {
        return Err(throw(
            "$sys.acquire: first argument must be datasource name (string)",
        ));
    };
    if name.is_empty() {
        return Err(throw("$sys.acquire: datasource not specified"));
    }
    if !with_sandbox(|s| s.datasources.contains(&name))? {
        return Err(throw(&format!(
            "$sys.acquire: unknown datasource {name:?}"
        )));
    }

    let mut timeout = None;
    if args.len() == 2 {
        let Some(seconds) = args[1].as_number().filter(|n| n.is_finite()) else {
            return Err(throw(
                "$sys.acquire: second argument must be timeout in seconds (number)",
            ));
        };
        if seconds > 0.0 {
            timeout = Some(Duration::from_secs_f64(seconds));
        }
    }

    let slot = with_sandbox(|s| {
        let acquired = s
            .handle
            .block_on(s.datasources.acquire(&name, timeout))
            .map_err(|err| format!("$sys.acquire({name:?}): {err}"))?;
        if s.debug {
            debug!(datasource = %name, "acquired connection");
        }
        s.conns.push(HeldConn {
            conn: acquired,
            persistent: !s.datasources.prefers_simple(&name),
        });
        Ok::<usize, String>(s.conns.len() - 1)
    })?;
    let slot = match slot {
        Ok(slot) => slot,
        Err(message) => return Err(throw(&message)),
    };

    // The hidden __rowgateConn property routes query/exec calls back to
    // the held connection.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    let obj = ObjectInitializer::new(context)
        .property(
            js_string!("__rowgateConn"),
            JsValue::from(slot as i32),
            Attribute::empty(),
        )
        .function(NativeFunction::from_fn_ptr(sys_query), js_string!("query"), 1)
        .function(NativeFunction::from_fn_ptr(sys_exec), js_string!("exec"), 1)
        .build();
    Ok(obj.into())
}

fn sys_query(this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let (sql, sql_args) = parse_sql_args("query", args, context)?;
    let slot = conn_slot(this, context)?;
    let result = with_sandbox(|s| {
        let held = s
            .conns
            .get_mut(slot)
            .ok_or_else(|| "$sys.query: connection is gone".to_string())?;
        let persistent = held.persistent;
        s.handle
            .block_on(query_on(&mut held.conn, &sql, &sql_args, persistent))
            .map_err(|err| err.to_string())
    })?;
    match result {
        Ok(rows) => JsValue::from_json(&json!({ "rows": rows }), context),
        Err(message) => Err(throw(&message)),
    }
}

fn sys_exec(this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let (sql, sql_args) = parse_sql_args("exec", args, context)?;
    let slot = conn_slot(this, context)?;
    let result = with_sandbox(|s| {
        let held = s
            .conns
            .get_mut(slot)
            .ok_or_else(|| "$sys.exec: connection is gone".to_string())?;
        let persistent = held.persistent;
        s.handle
            .block_on(execute_on(&mut held.conn, &sql, &sql_args, persistent))
            .map_err(|err| err.to_string())
    })?;
    match result {
        Ok(rows_affected) => JsValue::from_json(&json!({ "rowsAffected": rows_affected }), context),
        Err(message) => Err(throw(&message)),
    }
}

fn parse_sql_args(
    fname: &str,
    args: &[JsValue],
    context: &mut Context,
) -> JsResult<(String, Vec<ArgValue>)> {
    if args.is_empty() {
        return Err(throw(&format!("$sys.{fname}: need at least 1 argument")));
    }
    let Some(sql) = args[0].as_string().map(|s| s.to_std_string_escaped()) else {
        return Err(throw(&format!(
            "$sys.{fname}: first argument must be a SQL query (string)"
        )));
    };
    let mut sql_args = Vec::with_capacity(args.len() - 1);
    for arg in &args[1..] {
        sql_args.push(js_to_arg(arg, context));
    }
    Ok((sql, sql_args))
}

fn js_to_arg(value: &JsValue, context: &mut Context) -> ArgValue {
    if value.is_undefined() || value.is_null() {
        // Script arguments carry no declared type; a text NULL is the
        // fallback.
        return ArgValue::Null(NullKind::Text);
    }
    if let Some(b) = value.as_boolean() {
        return ArgValue::Bool(b);
    }
    if let Some(s) = value.as_string() {
        return ArgValue::Text(s.to_std_string_escaped());
    }
    if let Some(n) = value.as_number() {
        #[allow(clippy::cast_possible_truncation)]
        if n.fract() == 0.0 && n.abs() <= 9_007_199_254_740_992.0 {
            return ArgValue::Int(n as i64);
        }
        return ArgValue::Float(n);
    }
    match value.to_json(context) {
        Ok(v) => ArgValue::Json(v),
        Err(_) => ArgValue::Null(NullKind::Text),
    }
}

fn conn_slot(this: &JsValue, context: &mut Context) -> JsResult<usize> {
    let slot = this
        .as_object()
        .map(|obj| obj.get(js_string!("__rowgateConn"), context))
        .transpose()?
        .and_then(|v| v.as_number())
        .filter(|n| *n >= 0.0);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    slot.map(|n| n as usize)
        .ok_or_else(|| throw("connection object is not usable"))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn empty_host() -> ScriptHost {
        let sources = DataSources::connect(&[]).await.expect("empty connect");
        ScriptHost::new(Arc::new(sources), None)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn acquire_argument_count_is_checked() {
        let host = empty_host().await;
        let outcome = host.run("$sys.acquire(1,2,3)", Map::new(), false).await;
        assert_eq!(
            outcome.error.as_deref(),
            Some("Error: $sys.acquire: needs 1 or 2 arguments")
        );
        assert_eq!(
            outcome.value,
            ScriptValue::Object(json!({
                "Message": "Error: $sys.acquire: needs 1 or 2 arguments"
            }))
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn acquire_requires_a_datasource_name() {
        let host = empty_host().await;
        let outcome = host.run("$sys.acquire(1)", Map::new(), false).await;
        assert_eq!(
            outcome.error.as_deref(),
            Some("Error: $sys.acquire: first argument must be datasource name (string)")
        );

        let outcome = host.run("$sys.acquire('')", Map::new(), false).await;
        assert_eq!(
            outcome.error.as_deref(),
            Some("Error: $sys.acquire: datasource not specified")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn acquire_rejects_unknown_datasources() {
        let host = empty_host().await;
        let outcome = host
            .run("$sys.acquire('nosuchdatasource',10)", Map::new(), false)
            .await;
        assert_eq!(
            outcome.error.as_deref(),
            Some("Error: $sys.acquire: unknown datasource \"nosuchdatasource\"")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn result_classification_matches_contract() {
        let host = empty_host().await;

        let outcome = host.run("$sys.result='foo'", Map::new(), false).await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.value, ScriptValue::Text("foo".to_string()));

        let outcome = host.run("$sys.result=['foo']", Map::new(), false).await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.value, ScriptValue::Array(json!(["foo"])));

        let outcome = host.run("$sys.result={a:1}", Map::new(), false).await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.value, ScriptValue::Object(json!({"a": 1})));

        let outcome = host.run("1+1", Map::new(), false).await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.value, ScriptValue::Missing);

        let outcome = host.run("$sys.result=42", Map::new(), false).await;
        assert_eq!(outcome.value, ScriptValue::Other);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn thrown_strings_pass_through() {
        let host = empty_host().await;
        let outcome = host.run("throw 'foo'", Map::new(), false).await;
        assert_eq!(outcome.error.as_deref(), Some("foo"));
        assert_eq!(outcome.value, ScriptValue::Text("foo".to_string()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn syntax_errors_are_reported_as_error_objects() {
        let host = empty_host().await;
        let outcome = host.run("*** syntax error", Map::new(), false).await;
        assert!(outcome.error.is_some());
        assert!(matches!(outcome.value, ScriptValue::Object(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn params_are_visible_to_the_script() {
        let host = empty_host().await;
        let mut params = Map::new();
        params.insert("year".to_string(), json!(1972));
        let outcome = host
            .run("$sys.result = String($sys.params.year)", params, false)
            .await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.value, ScriptValue::Text("1972".to_string()));
    }
}
