//! Server lifecycle: composition of the datasource manager, parameter
//! engine, script host, notification dispatchers, job runner and the
//! HTTP router, with orderly startup and shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Request;
use axum::http::{HeaderValue, Method};
use axum::routing::{any, MethodFilter, MethodRouter};
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, Any, CorsLayer, ExposeHeaders};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use rowgate_config::{Cors, ServerConfig};
use rowgate_data::DataSources;
use rowgate_script::ScriptHost;

use crate::endpoint::serve_endpoint;
use crate::error::{ServerError, ServerResult};
use crate::jobs::spawn_jobs;
use crate::params::ParamEngine;
use crate::runtime::RuntimeInterface;
use crate::streams::{serve_stream, Dispatcher};

/// Shared state for every request handler. Read-only after startup.
pub(crate) struct Engine {
    pub config: Arc<ServerConfig>,
    pub runtime: Arc<RuntimeInterface>,
    pub datasources: Arc<DataSources>,
    pub params: ParamEngine,
    pub script: ScriptHost,
    pub dispatchers: HashMap<String, Arc<Dispatcher>>,
    pub cancel: CancellationToken,
}

struct Running {
    engine: Arc<Engine>,
    serve_task: JoinHandle<()>,
    job_tasks: Vec<JoinHandle<()>>,
    local_addr: SocketAddr,
}

/// The API server: validates its configuration at construction,
/// establishes pooled connections and routes at `start`, and tears
/// everything down in reverse dependency order at `stop`.
pub struct Server {
    config: Arc<ServerConfig>,
    runtime: Arc<RuntimeInterface>,
    running: Option<Running>,
}

impl Server {
    /// Create a server from a validated configuration and the embedder's
    /// runtime interface.
    ///
    /// # Errors
    ///
    /// Returns an error if validation produces any error finding.
    pub fn new(config: ServerConfig, runtime: RuntimeInterface) -> ServerResult<Self> {
        config
            .ensure_valid()
            .map_err(|source| ServerError::Config { source })?;
        Ok(Self {
            config: Arc::new(config),
            runtime: Arc::new(runtime),
            running: None,
        })
    }

    /// Address the server is bound to while running.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// Start the server: connect datasources, start notification
    /// dispatchers and the job runner, bind the listener and begin
    /// serving.
    ///
    /// # Errors
    ///
    /// Returns an error when any startup step fails; everything already
    /// started is torn down again.
    pub async fn start(&mut self) -> ServerResult<()> {
        if self.running.is_some() {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let params = ParamEngine::compile(&self.config.endpoints);

        let datasources = Arc::new(
            DataSources::connect(&self.config.datasources)
                .await
                .map_err(|source| ServerError::Datasource { source })?,
        );

        let dispatchers = match self.start_dispatchers(&datasources).await {
            Ok(dispatchers) => dispatchers,
            Err(err) => {
                datasources.close().await;
                return Err(err);
            }
        };

        let script = ScriptHost::new(
            Arc::clone(&datasources),
            self.runtime.init_script_context.clone(),
        );

        let engine = Arc::new(Engine {
            config: Arc::clone(&self.config),
            runtime: Arc::clone(&self.runtime),
            datasources: Arc::clone(&datasources),
            params,
            script,
            dispatchers,
            cancel: cancel.clone(),
        });

        let job_tasks = match spawn_jobs(&engine) {
            Ok(tasks) => tasks,
            Err(err) => {
                cancel.cancel();
                for dispatcher in engine.dispatchers.values() {
                    dispatcher.stop().await;
                }
                datasources.close().await;
                return Err(err);
            }
        };

        let router = build_router(&engine);
        let addr = self
            .config
            .listen_socket_addr()
            .map_err(|source| ServerError::Config { source })?;
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(source) => {
                cancel.cancel();
                for dispatcher in engine.dispatchers.values() {
                    dispatcher.stop().await;
                }
                datasources.close().await;
                return Err(ServerError::Bind { addr, source });
            }
        };
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr,
            source,
        })?;

        let shutdown = cancel.clone();
        let serve_task = tokio::spawn(async move {
            let service = router.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(err) = axum::serve(listener, service)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                error!(error = %err, "http server terminated");
            }
        });

        info!(listen = %local_addr, "API server started successfully");
        self.running = Some(Running {
            engine,
            serve_task,
            job_tasks,
            local_addr,
        });
        Ok(())
    }

    async fn start_dispatchers(
        &self,
        datasources: &Arc<DataSources>,
    ) -> ServerResult<HashMap<String, Arc<Dispatcher>>> {
        // One dispatcher per datasource that hosts at least one stream,
        // listening on the de-duplicated union of its channels.
        let mut channels_by_source: HashMap<String, Vec<String>> = HashMap::new();
        for stream in &self.config.streams {
            let channels = channels_by_source
                .entry(stream.datasource.clone())
                .or_default();
            if !channels.contains(&stream.channel) {
                channels.push(stream.channel.clone());
            }
        }

        let mut dispatchers = HashMap::new();
        for (source, channels) in channels_by_source {
            let listener = match datasources.listener(&source).await {
                Ok(listener) => listener,
                Err(source_err) => {
                    error!(datasource = %source, error = %source_err, "failed to open connection");
                    self.stop_dispatchers(&dispatchers).await;
                    return Err(ServerError::Dispatcher {
                        datasource: source,
                        source: source_err,
                    });
                }
            };
            match Dispatcher::start(source.clone(), channels, listener).await {
                Ok(dispatcher) => {
                    dispatchers.insert(source, Arc::new(dispatcher));
                }
                Err(err) => {
                    error!(datasource = %source, error = %err, "failed to start notification dispatcher");
                    self.stop_dispatchers(&dispatchers).await;
                    return Err(ServerError::Dispatcher {
                        datasource: source,
                        source: rowgate_data::DataError::Query { source: err },
                    });
                }
            }
        }
        Ok(dispatchers)
    }

    async fn stop_dispatchers(&self, dispatchers: &HashMap<String, Arc<Dispatcher>>) {
        for (name, dispatcher) in dispatchers {
            dispatcher.stop().await;
            info!(datasource = %name, "stopped notification dispatcher");
        }
    }

    /// Stop the server, waiting up to `timeout` for in-flight requests to
    /// drain before aborting them.
    ///
    /// # Errors
    ///
    /// Currently infallible in practice; the signature leaves room for
    /// shutdown diagnostics.
    pub async fn stop(&mut self, timeout: Duration) -> ServerResult<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        info!(timeout = timeout.as_secs_f64(), "stop request received, shutting down");

        // Stop accepting cron fires and cancel the background context.
        running.engine.cancel.cancel();
        for task in running.job_tasks {
            let _ = task.await;
        }

        self.stop_dispatchers(&running.engine.dispatchers).await;

        // Graceful HTTP shutdown, bounded by the caller's timeout; after
        // that, in-flight handlers are aborted outright.
        let abort = running.serve_task.abort_handle();
        if tokio::time::timeout(timeout, running.serve_task)
            .await
            .is_err()
        {
            error!("graceful shutdown timed out, aborting in-flight requests");
            abort.abort();
        }

        running.engine.datasources.close().await;
        info!("API server stopped");
        Ok(())
    }
}

fn build_router(engine: &Arc<Engine>) -> Router {
    let mut router = Router::new();

    for (idx, ep) in engine.config.endpoints.iter().enumerate() {
        let path = join_path(&engine.config.common_prefix, &ep.uri);
        let handler = {
            let engine = Arc::clone(engine);
            move |req: Request| {
                let engine = Arc::clone(&engine);
                async move { serve_endpoint(engine, idx, req).await }
            }
        };
        let route: MethodRouter = if ep.methods.is_empty() {
            any(handler)
        } else {
            let mut route = MethodRouter::new();
            for method in &ep.methods {
                if let Some(filter) = method_filter(method) {
                    route = route.on(filter, handler.clone());
                }
            }
            route
        };
        router = router.route(&path, route);
    }

    for (idx, stream) in engine.config.streams.iter().enumerate() {
        let path = join_path(&engine.config.common_prefix, &stream.uri);
        let handler = {
            let engine = Arc::clone(engine);
            move |req: Request| {
                let engine = Arc::clone(&engine);
                async move { serve_stream(engine, idx, req).await }
            }
        };
        router = router.route(&path, any(handler));
    }

    if let Some(cors) = &engine.config.cors {
        router = router.layer(cors_layer(cors));
    }
    if engine.config.compression {
        router = router.layer(CompressionLayer::new());
    }
    router.layer(TraceLayer::new_for_http())
}

fn join_path(prefix: &str, uri: &str) -> String {
    format!("{prefix}{uri}")
}

fn method_filter(method: &str) -> Option<MethodFilter> {
    match method {
        "GET" => Some(MethodFilter::GET),
        "POST" => Some(MethodFilter::POST),
        "PUT" => Some(MethodFilter::PUT),
        "PATCH" => Some(MethodFilter::PATCH),
        "DELETE" => Some(MethodFilter::DELETE),
        _ => None,
    }
}

fn cors_layer(cors: &Cors) -> CorsLayer {
    let mut layer = CorsLayer::new();

    layer = if cors.allowed_origins.is_empty() || cors.allowed_origins.iter().any(|o| o == "*") {
        layer.allow_origin(AllowOrigin::any())
    } else {
        let origins: Vec<HeaderValue> = cors
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        layer.allow_origin(AllowOrigin::list(origins))
    };

    layer = if cors.allowed_methods.is_empty() {
        layer.allow_methods(AllowMethods::list([Method::HEAD, Method::GET, Method::POST]))
    } else {
        let methods: Vec<Method> = cors
            .allowed_methods
            .iter()
            .filter_map(|m| m.parse().ok())
            .collect();
        layer.allow_methods(AllowMethods::list(methods))
    };

    layer = if cors.allowed_headers.iter().any(|h| h == "*") {
        layer.allow_headers(Any)
    } else if cors.allowed_headers.is_empty() {
        layer
    } else {
        let headers: Vec<_> = cors
            .allowed_headers
            .iter()
            .filter_map(|h| h.parse().ok())
            .collect();
        layer.allow_headers(AllowHeaders::list(headers))
    };

    if !cors.exposed_headers.is_empty() {
        let headers: Vec<_> = cors
            .exposed_headers
            .iter()
            .filter_map(|h| h.parse().ok())
            .collect();
        layer = layer.expose_headers(ExposeHeaders::list(headers));
    }

    if cors.allow_credentials {
        layer = layer.allow_credentials(true);
    }
    if let Some(max_age) = cors.max_age.filter(|a| *a > 0) {
        #[allow(clippy::cast_sign_loss)]
        let secs = max_age as u64;
        layer = layer.max_age(Duration::from_secs(secs));
    }

    layer
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowgate_config::Endpoint;

    fn minimal_config(port: u16) -> ServerConfig {
        ServerConfig {
            version: "1".to_string(),
            listen: format!("127.0.0.1:{port}"),
            endpoints: vec![Endpoint {
                uri: "/info-json".to_string(),
                methods: vec!["GET".to_string()],
                impl_type: "static-json".to_string(),
                script: "{\"apiVersion\":  1}".to_string(),
                ..Endpoint::default()
            }],
            ..ServerConfig::default()
        }
    }

    #[test]
    fn construction_rejects_invalid_configs() {
        let mut config = minimal_config(60610);
        config.version = "2".to_string();
        let err = Server::new(config, RuntimeInterface::default()).unwrap_err();
        assert!(matches!(err, ServerError::Config { .. }));
    }

    #[test]
    fn method_filters_cover_the_allowed_set() {
        for m in ["GET", "POST", "PUT", "PATCH", "DELETE"] {
            assert!(method_filter(m).is_some());
        }
        assert!(method_filter("TRACE").is_none());
    }

    #[tokio::test]
    async fn start_serve_and_stop_without_datasources() {
        let mut server =
            Server::new(minimal_config(60611), RuntimeInterface::default()).expect("valid config");
        server.start().await.expect("server should start");
        let addr = server.local_addr().expect("bound address");

        let body = fetch(addr, "/info-json").await;
        assert!(body.ends_with("{\"apiVersion\":  1}"));
        assert!(body.starts_with("HTTP/1.1 200"));
        assert!(body.contains("application/json"));

        server.stop(Duration::from_secs(5)).await.expect("stop");
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let mut server =
            Server::new(minimal_config(60612), RuntimeInterface::default()).expect("valid config");
        server.start().await.expect("server should start");
        let addr = server.local_addr().expect("bound address");

        let head = fetch(addr, "/nope").await;
        assert!(head.starts_with("HTTP/1.1 404"));

        server.stop(Duration::from_secs(5)).await.expect("stop");
    }

    async fn fetch(addr: SocketAddr, path: &str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut conn = tokio::net::TcpStream::connect(addr).await.expect("connect");
        let request = format!("GET {path} HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n");
        conn.write_all(request.as_bytes()).await.expect("write");
        let mut response = String::new();
        conn.read_to_string(&mut response).await.expect("read");
        response
    }
}
