//! Server lifecycle.
//!
//! Owns the startup sequence (validate options, configure correlation,
//! build the middleware chain, register and initialize plugins, acquire a
//! listener, run `onServerStart`, install signal handlers) and the
//! shutdown sequence (`close`: run `onStopping`/`onServerStop`, stop
//! accepting, drain in-flight requests bounded by the configured timeout,
//! terminate plugins in reverse, tear down the watcher).

pub mod options;
pub mod tls;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::response::IntoResponse;
use axum::Router;
use garde::Validate;
use tokio::sync::Notify;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

pub use options::{BodyLimitOptions, Http2Options, LoggingOptions, RuntimeEnv, ServerOptions};
pub use tls::TlsCredentials;

use crate::context::{CorrelationId, ServiceRegistry};
use crate::error::{ErrorKind, PortwayError};
use crate::middleware::{CorrelationMiddleware, CorsMiddleware, Middleware, RequestLoggerMiddleware};
use crate::pipeline::{handle_request, PipelineState};
use crate::plugin::{ErrorPolicy, Plugin, PluginHost, PluginManager};
use crate::registry::{RouteRegistry, WatchHandle};

/// A read-only handle to a running server, cheap to clone and hand to
/// application code (e.g. a health-check route) that needs to inspect the
/// route table without reaching into `Server` itself.
#[derive(Clone)]
pub struct ServerState {
    pub options: Arc<ServerOptions>,
    pub registry: Arc<RouteRegistry>,
}

/// A shared flag plus a waiter: one side requests an event, any number of
/// tasks observe it. Used both for the external shutdown request and the
/// internal "close the listener now" trigger.
#[derive(Clone)]
struct ShutdownSignal {
    requested: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownSignal {
    fn new() -> Self {
        ShutdownSignal {
            requested: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    fn request(&self) -> bool {
        let already = self.requested.swap(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        already
    }

    async fn wait(&self) {
        while !self.requested.load(Ordering::SeqCst) {
            let notified = self.notify.notified();
            if self.requested.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

/// Hooks run around shutdown, mirroring `close({ onStopping?, onStopped? })`.
#[derive(Default)]
pub struct CloseHooks {
    pub on_stopping: Option<Box<dyn FnOnce() + Send>>,
    pub on_stopped: Option<Box<dyn FnOnce() + Send>>,
}

/// The server lifecycle driver: built from validated options, it owns the
/// plugin manager and, once running, the route watcher. There is exactly
/// one of these per process.
pub struct Server {
    options: ServerOptions,
    user_middleware: Vec<Arc<dyn Middleware>>,
    plugins: PluginManager,
    registry: Arc<RouteRegistry>,
    services: Arc<ServiceRegistry>,
    shutdown: ShutdownSignal,
    shutdown_timeout: Duration,
    hooks: CloseHooks,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").finish_non_exhaustive()
    }
}

impl Server {
    /// Validate options and plugin declarations. Construction fails fast on
    /// an invalid configuration, matching the "exit code 1 on unrecoverable
    /// startup failure" contract — the caller decides how to report it.
    pub fn new(
        options: ServerOptions,
        user_middleware: Vec<Arc<dyn Middleware>>,
        plugins: Vec<Arc<dyn Plugin>>,
        plugin_error_policy: ErrorPolicy,
    ) -> Result<Self, PortwayError> {
        options
            .validate()
            .map_err(|err| PortwayError::internal(format!("invalid server options: {err}")))?;

        let registry = Arc::new(RouteRegistry::new(options.routes_dir.clone()));
        let services = Arc::new(ServiceRegistry::new());
        let host = PluginHost {
            services: services.clone(),
            registry: registry.clone(),
        };
        let plugins = PluginManager::new(plugins, plugin_error_policy, host);
        plugins.validate()?;

        let shutdown_timeout = Duration::from_secs(options.shutdown_timeout_secs);
        Ok(Server {
            registry,
            services,
            options,
            user_middleware,
            plugins,
            shutdown: ShutdownSignal::new(),
            shutdown_timeout,
            hooks: CloseHooks::default(),
        })
    }

    /// Install the `onStopping`/`onStopped` hooks `close()` runs. Call
    /// before [`Server::run`].
    pub fn with_close_hooks(mut self, hooks: CloseHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn state(&self) -> ServerState {
        ServerState {
            options: Arc::new(self.options.clone()),
            registry: self.registry.clone(),
        }
    }

    /// A handle that can request shutdown of a running [`Server::run`]
    /// without needing mutable or exclusive access to it.
    pub fn shutdown_handle(&self) -> ServerShutdown {
        ServerShutdown {
            signal: self.shutdown.clone(),
        }
    }

    /// The chain every request runs: the baked-in request logger first,
    /// then correlation, then CORS when a policy is configured, then user
    /// middleware.
    fn global_middleware(&self) -> Vec<Arc<dyn Middleware>> {
        let mut chain: Vec<Arc<dyn Middleware>> = Vec::new();
        if self.options.logging.request_logging {
            chain.push(Arc::new(RequestLoggerMiddleware));
        }
        chain.push(Arc::new(CorrelationMiddleware));
        if let Some(policy) = &self.options.cors {
            chain.push(Arc::new(CorsMiddleware::new(policy.clone())));
        }
        chain.extend(self.user_middleware.iter().cloned());
        chain
    }

    /// Run the full startup sequence and serve until a shutdown signal (an
    /// OS signal, or an explicit [`ServerShutdown::close`]) completes the
    /// graceful drain.
    pub async fn run(mut self) -> Result<(), PortwayError> {
        let correlation = CorrelationId {
            header_name: self.options.correlation_header.clone(),
            ..CorrelationId::default()
        };

        // Populate the route table before accepting traffic; in
        // development also start watching for edits.
        let report = self.registry.load_all().await?;
        tracing::info!(routes = report.route_count, conflicts = report.conflicts.len(), "routes loaded");
        for conflict in &report.conflicts {
            tracing::warn!(
                path = %conflict.path,
                method = %conflict.method,
                winner = %conflict.winning_file,
                loser = %conflict.losing_file,
                "route conflict at startup"
            );
        }
        let watch: Option<WatchHandle> = if self.options.env.is_development() {
            Some(self.registry.watch()?)
        } else {
            None
        };

        // Register, then initialize. A `register` failure is fatal startup
        // failure regardless of the configured error policy; `initialize`
        // failures go through the policy.
        let register_errors = self.plugins.register().await.map_err(PortwayError::from)?;
        if let Some(err) = register_errors.into_iter().next() {
            return Err(err.into());
        }
        for err in self.plugins.initialize().await.map_err(PortwayError::from)? {
            tracing::error!(plugin = %err.plugin, error = %err.message, "plugin initialize failed");
        }

        let pipeline_state = Arc::new(PipelineState {
            registry: self.registry.clone(),
            global_middleware: self.global_middleware(),
            correlation,
            body_limits: self.options.body_limits.clone().into(),
            temp_dir: std::env::temp_dir(),
            services: self.services.clone(),
        });
        let app: Router = Router::new()
            .fallback(handle_request)
            .with_state(pipeline_state)
            .layer(TraceLayer::new_for_http())
            .layer(CatchPanicLayer::custom(panic_handler as fn(_) -> _));

        // Acquire the listener. Binding happens here, not inside the serve
        // task, so an unbindable address is a fatal startup error.
        let addr = format!("{}:{}", self.options.host, self.options.port);
        let drain = ShutdownSignal::new();
        let mut serve_task = if self.options.http2.enabled {
            let credentials = tls::acquire_credentials(&self.options.http2, self.options.env)?;
            let config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
                &credentials.cert_path,
                &credentials.key_path,
            )
            .await
            .map_err(|err| PortwayError::internal(format!("failed to load TLS credentials: {err}")))?;
            let listener = std::net::TcpListener::bind(&addr)
                .map_err(|err| PortwayError::internal(format!("failed to bind {addr}: {err}")))?;
            listener.set_nonblocking(true)?;
            tracing::info!(%addr, "listening (http/2 over tls)");
            tokio::spawn(serve_https(listener, config, app, drain.clone(), self.shutdown_timeout))
        } else {
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .map_err(|err| PortwayError::internal(format!("failed to bind {addr}: {err}")))?;
            tracing::info!(%addr, "listening (http/1.1)");
            tokio::spawn(serve_http(listener, app, drain.clone()))
        };

        for err in self.plugins.on_server_start().await.map_err(PortwayError::from)? {
            tracing::error!(plugin = %err.plugin, error = %err.message, "plugin onServerStart failed");
        }

        // Serve until a shutdown is requested, or until the serve task
        // dies on its own (listener error).
        let early_exit = tokio::select! {
            joined = &mut serve_task => Some(flatten_join(joined)),
            _ = wait_for_shutdown(self.shutdown.clone()) => None,
        };

        tracing::info!("stopping");
        if let Some(on_stopping) = self.hooks.on_stopping.take() {
            on_stopping();
        }
        if let Err(err) = self.plugins.on_server_stop().await {
            tracing::error!(error = %err, "onServerStop failed");
        }

        // Close the listener and drain in-flight requests, bounded by the
        // shutdown timeout (plus a short grace for the TLS path, where
        // axum-server enforces the same deadline itself).
        let serve_result = match early_exit {
            Some(result) => result,
            None => {
                drain.request();
                let deadline = self.shutdown_timeout + Duration::from_millis(500);
                match tokio::time::timeout(deadline, &mut serve_task).await {
                    Ok(joined) => flatten_join(joined),
                    Err(_) => {
                        serve_task.abort();
                        Err(PortwayError::new(
                            ErrorKind::ShutdownTimeout,
                            format!(
                                "graceful drain did not finish within {}s",
                                self.shutdown_timeout.as_secs()
                            ),
                        ))
                    }
                }
            }
        };

        // Remaining teardown runs on every exit path, success or error.
        if let Err(err) = self.plugins.terminate().await {
            tracing::error!(error = %err, "terminate failed");
        }
        if let Some(watch) = watch {
            watch.stop();
        }
        if let Some(on_stopped) = self.hooks.on_stopped.take() {
            on_stopped();
        }
        tracing::info!("server stopped");

        serve_result
    }
}

fn flatten_join(
    joined: Result<Result<(), PortwayError>, tokio::task::JoinError>,
) -> Result<(), PortwayError> {
    match joined {
        Ok(result) => result,
        Err(err) => Err(PortwayError::internal(format!("serve task failed: {err}"))),
    }
}

/// An external handle that can trigger [`Server::run`]'s graceful shutdown
/// without owning the server itself — the Rust-idiomatic replacement for
/// calling `close()` on a live server object from another part of the
/// program (e.g. a test harness, or an admin route).
#[derive(Clone)]
pub struct ServerShutdown {
    signal: ShutdownSignal,
}

impl ServerShutdown {
    /// Request a graceful shutdown. Idempotent: a second call is a no-op.
    pub fn close(&self) {
        self.signal.request();
    }
}

fn panic_handler(_err: Box<dyn std::any::Any + Send>) -> axum::response::Response {
    PortwayError::internal("request handler panicked").into_response()
}

async fn serve_http(
    listener: tokio::net::TcpListener,
    app: Router,
    drain: ShutdownSignal,
) -> Result<(), PortwayError> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { drain.wait().await })
        .await
        .map_err(|err| PortwayError::internal(format!("server error: {err}")))
}

async fn serve_https(
    listener: std::net::TcpListener,
    config: axum_server::tls_rustls::RustlsConfig,
    app: Router,
    drain: ShutdownSignal,
    timeout: Duration,
) -> Result<(), PortwayError> {
    let handle = axum_server::Handle::new();
    let drain_handle = handle.clone();
    tokio::spawn(async move {
        drain.wait().await;
        drain_handle.graceful_shutdown(Some(timeout));
    });

    axum_server::from_tcp_rustls(listener, config)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .map_err(|err| PortwayError::internal(format!("server error: {err}")))
}

/// Resolve on whichever comes first: `SIGINT`, `SIGTERM`, or an explicit
/// [`ServerShutdown::close`] call.
async fn wait_for_shutdown(signal: ShutdownSignal) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for Ctrl-C");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = signal.wait() => {},
    }

    signal.request();
    tracing::info!("shutdown signal received, starting graceful shutdown");
}
