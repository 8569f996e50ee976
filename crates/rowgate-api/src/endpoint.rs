//! Endpoint dispatch: request decoding, parameter collection, the four
//! implementation kinds, the response cache, and per-endpoint timeouts.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::{FromRequestParts, RawPathParams, Request};
use axum::http::{header, request::Parts, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use flate2::read::{DeflateDecoder, GzDecoder};
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use rowgate_config::{Endpoint, ImplKind};
use rowgate_data::ArgValue;
use rowgate_script::{ScriptOutcome, ScriptValue};

use crate::cache::{cache_key, fresh_body, store_value};
use crate::encode::{
    exec_error_json, exec_result_json, pretty_json, query_result_json, rows_to_csv,
};
use crate::params::RequestValues;
use crate::server::Engine;

const CONTENT_TYPE_JSON: &str = "application/json";
const CONTENT_TYPE_TEXT: &str = "text/plain; charset=utf-8";
const CONTENT_TYPE_CSV: &str = "text/csv; charset=utf-8";

// Bounded request body read, applied both before and after transparent
// decompression.
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

pub(crate) async fn serve_endpoint(engine: Arc<Engine>, idx: usize, req: Request) -> Response {
    let ep = &engine.config.endpoints[idx];
    let uri = format!("{}{}", engine.config.common_prefix, ep.uri);
    let started = Instant::now();

    let ip = real_ip(&req);
    let values = match decode_request(req).await {
        Ok(values) => values,
        Err(reason) => {
            error!(endpoint = %uri, error = %reason, "failed to decode request body");
            return plain_error(StatusCode::BAD_REQUEST, &reason);
        }
    };

    let args = match engine.params.collect(ep, &values) {
        Ok(args) => args,
        Err(err) => {
            error!(endpoint = %uri, param = %err.name, error = %err.reason, "failed to get valid parameter values from client");
            return plain_error(StatusCode::BAD_REQUEST, &err.to_string());
        }
    };

    if ep.debug {
        let rendered: Vec<Value> = args.iter().map(ArgValue::to_json).collect();
        let params_json = Value::Array(rendered);
        debug!(endpoint = %uri, params = %params_json, ip = %ip, "handler start");
    }

    let response = match ep.kind() {
        Some(ImplKind::StaticText | ImplKind::StaticJson) => serve_static(ep),
        Some(ImplKind::Exec) => serve_exec(&engine, ep, &args).await,
        Some(ImplKind::QueryJson | ImplKind::QueryCsv) => {
            serve_query(&engine, ep, &uri, &args).await
        }
        Some(ImplKind::Script) => serve_script(&engine, ep, &args).await,
        None => plain_error(StatusCode::INTERNAL_SERVER_ERROR, "invalid implementation type"),
    };

    let elapsed_ms = started.elapsed().as_secs_f64() * 1e3;
    engine
        .runtime
        .emit_metric("epserve", &[format!("endpoint={uri}")], elapsed_ms);
    if ep.debug {
        debug!(endpoint = %uri, elapsed = elapsed_ms, "handler end");
    }
    response
}

async fn decode_request(req: Request) -> Result<RequestValues, String> {
    let (mut parts, body) = req.into_parts();

    let mut values = RequestValues {
        path: path_params(&mut parts).await,
        ..RequestValues::default()
    };

    if parts.method == Method::GET {
        if let Some(query) = parts.uri.query() {
            values.query = multi_map(query.as_bytes());
        }
        return Ok(values);
    }

    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|err| format!("failed to read request body: {err}"))?;

    let bytes = match header_value(&parts.headers, header::CONTENT_ENCODING).as_deref() {
        Some("gzip") => {
            let mut decoded = Vec::new();
            GzDecoder::new(&bytes[..])
                .take(MAX_BODY_BYTES as u64)
                .read_to_end(&mut decoded)
                .map_err(|err| format!("failed to decode gzip request body: {err}"))?;
            decoded.into()
        }
        Some("deflate") => {
            let mut decoded = Vec::new();
            // A broken deflate stream decodes to garbage that the body
            // parsers below treat as an absent body.
            if DeflateDecoder::new(&bytes[..])
                .take(MAX_BODY_BYTES as u64)
                .read_to_end(&mut decoded)
                .is_err()
            {
                warn!("failed to decode deflate request body");
                decoded.clear();
            }
            decoded.into()
        }
        _ => bytes,
    };

    match content_type(&parts.headers).as_deref() {
        Some("application/json") => match serde_json::from_slice::<Map<String, Value>>(&bytes) {
            Ok(object) => values.json_body = Some(object),
            Err(err) => warn!(error = %err, "failed to decode json object in request body"),
        },
        Some("application/x-www-form-urlencoded") => {
            values.form_body = Some(multi_map(&bytes));
        }
        _ => {}
    }

    Ok(values)
}

async fn path_params(parts: &mut Parts) -> HashMap<String, String> {
    match RawPathParams::from_request_parts(parts, &()).await {
        Ok(raw) => raw
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        Err(_) => HashMap::new(),
    }
}

fn multi_map(raw: &[u8]) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for (key, value) in url::form_urlencoded::parse(raw) {
        map.entry(key.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    map
}

fn content_type(headers: &HeaderMap) -> Option<String> {
    header_value(headers, header::CONTENT_TYPE)
}

fn header_value(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    let value = headers.get(name)?.to_str().ok()?;
    let value = value.split(';').next().unwrap_or(value);
    Some(value.trim().to_ascii_lowercase())
}

fn real_ip(req: &Request) -> String {
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if !forwarded.is_empty() {
            return forwarded
                .split(',')
                .next()
                .unwrap_or(forwarded)
                .trim()
                .to_string();
        }
    }
    if let Some(real) = req.headers().get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !real.is_empty() {
            return real.to_string();
        }
    }
    req.extensions()
        .get::<ConnectInfo<std::net::SocketAddr>>()
        .map_or_else(|| "-".to_string(), |info| info.0.ip().to_string())
}

fn serve_static(ep: &Endpoint) -> Response {
    let content_type = if ep.kind() == Some(ImplKind::StaticJson) {
        CONTENT_TYPE_JSON
    } else {
        CONTENT_TYPE_TEXT
    };
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type)],
        ep.script.clone(),
    )
        .into_response()
}

fn op_timeout(seconds: Option<f64>) -> Option<Duration> {
    seconds.filter(|t| *t > 0.0).map(Duration::from_secs_f64)
}

fn serve_exec<'a>(
    engine: &'a Engine,
    ep: &'a Endpoint,
    args: &'a [ArgValue],
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Response> + Send + 'a>> {
    Box::pin(async move {
        let started = Instant::now();
        let result = engine
            .datasources
            .execute(
                &ep.datasource,
                ep.tx_options.as_ref(),
                op_timeout(ep.timeout),
                &ep.script,
                args,
            )
            .await;

        match result {
            Ok(rows_affected) => {
                if ep.debug {
                    debug!(elapsed = started.elapsed().as_secs_f64() * 1e3, "exec completed successfully");
                }
                (
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, CONTENT_TYPE_JSON)],
                    exec_result_json(rows_affected),
                )
                    .into_response()
            }
            Err(err) => {
                error!(error = %err, "exec failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    [(header::CONTENT_TYPE, CONTENT_TYPE_JSON)],
                    exec_error_json(&err.to_string()),
                )
                    .into_response()
            }
        }
    })
}

fn serve_query<'a>(
    engine: &'a Engine,
    ep: &'a Endpoint,
    uri: &'a str,
    args: &'a [ArgValue],
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Response> + Send + 'a>> {
    Box::pin(async move {
        let is_json = ep.kind() == Some(ImplKind::QueryJson);
        let content_type = if is_json { CONTENT_TYPE_JSON } else { CONTENT_TYPE_CSV };

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let cache_ttl_nanos = ep
            .cache
            .filter(|ttl| *ttl > 0.0)
            .map_or(0, |ttl| (ttl * 1e9) as u64);
        let use_cache = cache_ttl_nanos > 0 && engine.runtime.cache_enabled();
        let mut key = 0;
        if use_cache {
            key = cache_key(uri, args);
            if let Some(entry) = engine.runtime.cache_fetch(key) {
                if let Some(body) = fresh_body(&entry, cache_ttl_nanos) {
                    if ep.debug {
                        debug!(cachekey = key, "cache hit, cache still valid, serving from cache");
                    }
                    return (
                        StatusCode::OK,
                        [(header::CONTENT_TYPE, content_type)],
                        body.to_vec(),
                    )
                        .into_response();
                }
                if ep.debug {
                    debug!(cachekey = key, "cache hit but value is stale, deleting");
                }
                engine.runtime.cache_store(key, None);
            } else if ep.debug {
                debug!(cachekey = key, "cache miss");
            }
        }

        let started = Instant::now();
        let result = engine
            .datasources
            .query(
                &ep.datasource,
                ep.tx_options.as_ref(),
                op_timeout(ep.timeout),
                &ep.script,
                args,
            )
            .await;

        let rows = match result {
            Ok(rows) => rows,
            Err(err) => {
                error!(error = %err, "query failed");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    [(header::CONTENT_TYPE, CONTENT_TYPE_JSON)],
                    query_result_json(None, Some(&err.to_string())),
                )
                    .into_response();
            }
        };
        if ep.debug {
            debug!(elapsed = started.elapsed().as_secs_f64() * 1e3, "query completed successfully");
        }

        let body: Vec<u8> = if is_json {
            query_result_json(Some(&rows), None).into_bytes()
        } else {
            rows_to_csv(&rows)
        };

        if use_cache {
            if ep.debug {
                debug!(cachekey = key, valuelen = body.len(), "storing result in cache");
            }
            engine.runtime.cache_store(key, Some(store_value(&body)));
        }

        (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], body).into_response()
    })
}

fn serve_script<'a>(
    engine: &'a Engine,
    ep: &'a Endpoint,
    args: &'a [ArgValue],
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Response> + Send + 'a>> {
    Box::pin(async move {
        let mut params = Map::new();
        for (p, arg) in ep.params.iter().zip(args) {
            params.insert(p.name.clone(), arg.to_json());
        }

        let outcome = engine.script.run(&ep.script, params, ep.debug).await;
        script_response(outcome)
    })
}

pub(crate) fn script_response(outcome: ScriptOutcome) -> Response {
    let no_result = matches!(outcome.value, ScriptValue::Missing);

    if let Some(message) = outcome.error {
        if no_result {
            error!(error = %message, "script failed");
            return bare_error(StatusCode::INTERNAL_SERVER_ERROR, &message);
        }
        return match render_script_value(StatusCode::INTERNAL_SERVER_ERROR, &outcome.value) {
            Some(response) => {
                error!(error = %message, "script failed with result");
                response
            }
            None => {
                error!("script failed, also unsupported result type from script");
                bare_error(StatusCode::INTERNAL_SERVER_ERROR, "script error")
            }
        };
    }

    if no_result {
        return StatusCode::NO_CONTENT.into_response();
    }

    render_script_value(StatusCode::OK, &outcome.value).unwrap_or_else(|| {
        error!("unsupported result type from script");
        plain_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "unsupported result type from script",
        )
    })
}

fn render_script_value(status: StatusCode, value: &ScriptValue) -> Option<Response> {
    match value {
        ScriptValue::Text(s) => Some(
            (
                status,
                [(header::CONTENT_TYPE, CONTENT_TYPE_TEXT)],
                s.clone(),
            )
                .into_response(),
        ),
        ScriptValue::Object(v) => Some(
            (
                status,
                [(header::CONTENT_TYPE, CONTENT_TYPE_JSON)],
                pretty_json(v),
            )
                .into_response(),
        ),
        _ => None,
    }
}

// A 400/500 with a plain-text reason, newline-terminated.
pub(crate) fn plain_error(status: StatusCode, reason: &str) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, CONTENT_TYPE_TEXT)],
        format!("{reason}\n"),
    )
        .into_response()
}

// A failure body with no content type, exactly as produced by the script
// path when the script wrote no usable result.
fn bare_error(status: StatusCode, body: &str) -> Response {
    Response::builder()
        .status(status)
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| status.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        String::from_utf8(bytes.to_vec()).expect("utf8")
    }

    #[tokio::test]
    async fn script_error_without_result_is_plain_500() {
        let response = script_response(ScriptOutcome {
            value: ScriptValue::Missing,
            error: Some("Error: something broke".to_string()),
        });
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_string(response).await, "Error: something broke");
    }

    #[tokio::test]
    async fn script_error_object_renders_as_pretty_json() {
        let response = script_response(ScriptOutcome {
            value: ScriptValue::Object(json!({
                "Message": "Error: $sys.acquire: unknown datasource \"nosuchdatasource\""
            })),
            error: Some("Error: $sys.acquire: unknown datasource \"nosuchdatasource\"".to_string()),
        });
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
            Some(CONTENT_TYPE_JSON)
        );
        assert_eq!(
            body_string(response).await,
            "{\n  \"Message\": \"Error: $sys.acquire: unknown datasource \\\"nosuchdatasource\\\"\"\n}\n"
        );
    }

    #[tokio::test]
    async fn script_string_result_is_plain_text() {
        let response = script_response(ScriptOutcome {
            value: ScriptValue::Text("foo".to_string()),
            error: None,
        });
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
            Some(CONTENT_TYPE_TEXT)
        );
        assert_eq!(body_string(response).await, "foo");
    }

    #[tokio::test]
    async fn script_array_result_is_unsupported() {
        let response = script_response(ScriptOutcome {
            value: ScriptValue::Array(json!(["foo"])),
            error: None,
        });
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_string(response).await,
            "unsupported result type from script\n"
        );
    }

    #[tokio::test]
    async fn script_missing_result_is_no_content() {
        let response = script_response(ScriptOutcome {
            value: ScriptValue::Missing,
            error: None,
        });
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[test]
    fn multi_map_collects_repeated_keys() {
        let map = multi_map(b"a=1&a=2&b=x%20y");
        assert_eq!(map["a"], vec!["1", "2"]);
        assert_eq!(map["b"], vec!["x y"]);
    }

    #[test]
    fn content_type_strips_parameters() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            "application/JSON; charset=utf-8".parse().expect("header"),
        );
        assert_eq!(content_type(&headers).as_deref(), Some("application/json"));
    }
}
