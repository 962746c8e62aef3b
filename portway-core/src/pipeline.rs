//! The request pipeline controller.
//!
//! Ties the matcher, context, middleware composer, schema validation gate,
//! error boundary, and body intake into one per-request flow, exposed as
//! an axum fallback service: match, build the context, run the composed
//! chain (whose terminal step validates, decodes the body, and invokes the
//! handler), and translate any failure into a wire-format error response.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::{HeaderName, HeaderValue, Request, StatusCode};

use crate::body::{self, BodyLimits, DecodedBody, PersistStrategy};
use crate::context::{self, Context, CorrelationId, ServiceRegistry};
use crate::error::{ErrorKind, PortwayError};
use crate::matcher::MatchResult;
use crate::middleware::{compose, ChainFuture, CorsResponseHeaders, Middleware};
use crate::registry::RouteRegistry;
use crate::route::RouteMethod;
use crate::validation::{validate_files, validate_response, validate_section};

/// Everything the pipeline needs that outlives a single request.
pub struct PipelineState {
    pub registry: Arc<RouteRegistry>,
    pub global_middleware: Vec<Arc<dyn Middleware>>,
    pub correlation: CorrelationId,
    pub body_limits: BodyLimits,
    pub temp_dir: PathBuf,
    pub services: Arc<ServiceRegistry>,
}

/// Methods whose requests may carry a body worth decoding.
fn method_accepts_body(method: &http::Method) -> bool {
    matches!(*method, http::Method::POST | http::Method::PUT | http::Method::PATCH | http::Method::DELETE)
}

/// The axum entry point: every request not otherwise handled by the router
/// arrives here and is driven through the full pipeline.
pub async fn handle_request(
    State(state): State<Arc<PipelineState>>,
    request: Request<Body>,
) -> Response {
    let started = Instant::now();
    let (parts, body) = request.into_parts();
    let method = parts.method.clone();
    let path = parts.uri.path().to_string();
    let correlation_id = state.correlation.derive(&parts.headers);

    let outcome = CorrelationId::scope(correlation_id.clone(), run_request(&state, parts, body)).await;

    let mut response = match outcome {
        Ok(response) => response,
        Err(mut err) => {
            err.tag_correlation_id(&correlation_id);
            tracing::warn!(
                kind = err.kind().title(),
                status = err.kind().status().as_u16(),
                correlation_id = %correlation_id,
                "request failed"
            );
            err.into_response()
        }
    };

    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(state.correlation.header_name.as_bytes()),
        HeaderValue::from_str(&correlation_id),
    ) {
        response.headers_mut().insert(name, value);
    }

    tracing::info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        duration_ms = started.elapsed().as_millis() as u64,
        correlation_id = %correlation_id,
        "request completed"
    );

    response
}

async fn run_request(
    state: &PipelineState,
    parts: http::request::Parts,
    body: Body,
) -> Result<Response, PortwayError> {
    let path = parts.uri.path().to_string();
    let method = parts.method.clone();

    let (route_method, params) = match state.registry.match_route(&path, &method) {
        MatchResult::Found { route_method, params } => (route_method, params),
        MatchResult::MethodNotAllowed { allowed } => {
            let mut names: Vec<&str> = allowed.iter().map(http::Method::as_str).collect();
            names.sort_unstable();
            let err = PortwayError::method_not_allowed(names.join(", "));
            // An OPTIONS request to a path that exists under other methods
            // still runs the global chain, so a preflight middleware can
            // short-circuit with its own response; without one the 405
            // surfaces as usual.
            if method == http::Method::OPTIONS && !state.global_middleware.is_empty() {
                let ctx = base_context(state, &parts, &path);
                let chain = compose(state.global_middleware.clone(), failing_terminal(err));
                let (ctx, value) = chain(ctx).await?;
                return write_response(ctx, value);
            }
            return Err(err);
        }
        MatchResult::NotFound => return Err(PortwayError::not_found()),
    };

    let mut ctx = base_context(state, &parts, &path);
    ctx.params = params;

    if method_accepts_body(&method) {
        if is_multipart(content_type_of(&parts.headers)) {
            // Multipart bodies are not buffered here: the terminal step
            // feeds the live stream to the part parser, which enforces its
            // caps as bytes arrive.
            ctx.state.insert(PendingBody::new(body));
        } else {
            ctx.body = read_body(&parts.headers, body, &state.body_limits).await?;
        }
    }

    let middlewares = build_middleware_list(&state.global_middleware, &route_method);
    let chain = compose(
        middlewares,
        terminal(route_method, state.body_limits.clone(), state.temp_dir.clone()),
    );
    let (ctx, value) = chain(ctx).await?;

    write_response(ctx, value)
}

/// The not-yet-consumed request body, parked in `Context::state` for
/// content types the terminal step parses as a stream. Exactly one taker.
struct PendingBody(std::sync::Mutex<Option<Body>>);

impl PendingBody {
    fn new(body: Body) -> Self {
        PendingBody(std::sync::Mutex::new(Some(body)))
    }

    fn take(&self) -> Option<Body> {
        self.0.lock().unwrap().take()
    }
}

fn is_multipart(content_type: &str) -> bool {
    content_type.to_ascii_lowercase().starts_with("multipart/")
}

fn base_context(state: &PipelineState, parts: &http::request::Parts, path: &str) -> Context {
    let mut ctx = Context::with_services(
        parts.method.clone(),
        path.to_string(),
        parts.headers.clone(),
        context::current().unwrap_or_default(),
        state.services.clone(),
    );
    ctx.query = context::parse_query(parts.uri.query());
    ctx
}

/// A terminal step that fails with a fixed error, used when the chain runs
/// only so middleware ahead of it can answer (preflight).
fn failing_terminal(err: PortwayError) -> impl Fn(Context) -> ChainFuture + Send + Sync + 'static {
    move |_ctx: Context| -> ChainFuture {
        let err = err.clone();
        Box::pin(async move { Err(err) })
    }
}

/// Read the request body into memory, capped by the content-type's
/// configured limit so an oversized payload fails before any further work.
async fn read_body(
    headers: &http::HeaderMap,
    body: Body,
    limits: &BodyLimits,
) -> Result<Bytes, PortwayError> {
    let limit = read_cap(content_type_of(headers), limits);
    axum::body::to_bytes(body, limit).await.map_err(|_| {
        PortwayError::new(
            ErrorKind::PayloadTooLarge,
            format!("body exceeds the {limit}-byte limit"),
        )
    })
}

fn content_type_of(headers: &http::HeaderMap) -> &str {
    headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

// Multipart never passes through here; its stream goes straight to the
// part parser, which owns those caps.
fn read_cap(content_type: &str, limits: &BodyLimits) -> usize {
    let mime = content_type.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    match mime.as_str() {
        "application/json" => limits.json,
        "application/x-www-form-urlencoded" => limits.form,
        m if m.starts_with("text/") => limits.text,
        _ => limits.raw,
    }
}

fn build_middleware_list(
    global: &[Arc<dyn Middleware>],
    route_method: &RouteMethod,
) -> Vec<Arc<dyn Middleware>> {
    let mut list = Vec::with_capacity(global.len() + route_method.middleware.len());
    list.extend(global.iter().cloned());
    list.extend(route_method.middleware.iter().cloned());
    list
}

/// The chain's terminal step: validates params and query, decodes and
/// validates the body, invokes the route handler, and validates its return
/// value against the response schema. Running all of this *inside* the
/// terminal keeps middleware ahead of validation — an auth middleware
/// rejects before an invalid body is ever decoded, and a short-circuiting
/// middleware skips body work entirely.
///
/// [`crate::route::Handler::call`] consumes the context and returns only
/// the handler's value. A middleware wrapping the terminal step (e.g.
/// CORS, which writes to `ctx.state` only *after* `next()` returns) still
/// needs a context to write into, so this reconstructs one carrying the
/// original request identity forward, with a fresh `state` map.
fn terminal(
    route_method: RouteMethod,
    limits: BodyLimits,
    temp_dir: PathBuf,
) -> impl Fn(Context) -> ChainFuture + Send + Sync + 'static {
    let route_method = Arc::new(route_method);
    move |mut ctx: Context| -> ChainFuture {
        let route_method = route_method.clone();
        let limits = limits.clone();
        let temp_dir = temp_dir.clone();
        Box::pin(async move {
            let schema = &route_method.schema;
            validate_section(
                schema.params.as_deref(),
                "params",
                &serde_json::to_value(&ctx.params).unwrap_or(serde_json::Value::Null),
            )?;
            validate_section(schema.query.as_deref(), "query", &context::query_to_json(&ctx.query))?;

            let mut cleanup = Vec::new();
            let prepared = if method_accepts_body(&ctx.method) {
                prepare_body(&mut ctx, &route_method, &limits, &temp_dir, &mut cleanup).await
            } else {
                Ok(())
            };

            let outcome = match prepared {
                Ok(()) => {
                    let identity = RequestIdentity::from(&ctx);
                    let handled = route_method.handler.call(ctx).await;
                    handled.and_then(|value| {
                        validate_response(schema.response.as_deref(), &value)?;
                        Ok((identity.into_context(), value))
                    })
                }
                Err(err) => Err(err),
            };

            // Temp files registered during multipart persistence are
            // removed on every exit path, success or failure.
            body::run_cleanup_batch(cleanup);
            outcome
        })
    }
}

/// Decode `ctx.body` per its content type, validate it against the route's
/// body and file schemas, and stash the decoded forms in `ctx.state` for
/// the handler.
async fn prepare_body(
    ctx: &mut Context,
    route_method: &RouteMethod,
    limits: &BodyLimits,
    temp_dir: &std::path::Path,
    cleanup: &mut Vec<body::CleanupTask>,
) -> Result<(), PortwayError> {
    let content_type = content_type_of(&ctx.headers).to_string();
    let schema = &route_method.schema;

    if is_multipart(&content_type) {
        let boundary = body::extract_boundary(&content_type).ok_or_else(|| {
            PortwayError::new(ErrorKind::UnprocessableEntity, "No valid multipart data found")
        })?;
        let wire = ctx
            .state
            .get::<PendingBody>()
            .and_then(PendingBody::take)
            .ok_or_else(|| PortwayError::internal("multipart body already consumed"))?;
        let strategy = multipart_strategy(&route_method.options);
        let parsed = body::parse_multipart(
            wire.into_data_stream(),
            boundary,
            &limits.multipart,
            strategy,
            temp_dir,
        )
        .await?;
        let (multipart, tasks) = parsed.into_parts();
        cleanup.extend(tasks);
        validate_section(
            schema.body.as_deref(),
            "body",
            &serde_json::to_value(&multipart.fields.text).unwrap_or(serde_json::Value::Null),
        )?;
        validate_files(&schema.files, &multipart)?;
        ctx.state.insert(multipart);
        return Ok(());
    }

    let decoded = body::decode_body(&content_type, ctx.body.clone(), limits)?;
    if schema.body.is_some() && matches!(decoded, DecodedBody::Raw(_)) {
        return Err(PortwayError::new(
            ErrorKind::UnsupportedMediaType,
            format!("content type '{content_type}' is not supported for this route"),
        ));
    }
    validate_section(schema.body.as_deref(), "body", &decoded.as_validatable_json())?;
    ctx.state.insert(decoded);
    Ok(())
}

/// Pull the persistence strategy out of the route's opaque options
/// (`options.multipart.strategy`), defaulting to in-memory.
fn multipart_strategy(options: &serde_json::Value) -> PersistStrategy {
    options
        .get("multipart")
        .and_then(|m| m.get("strategy"))
        .and_then(|s| s.as_str())
        .map(PersistStrategy::from_name)
        .unwrap_or(PersistStrategy::Memory)
}

/// The parts of a [`Context`] cheap enough to clone, carried across the
/// handler-call boundary so the chain still has somewhere to write
/// post-handler state.
struct RequestIdentity {
    method: http::Method,
    path: String,
    headers: http::HeaderMap,
    correlation_id: String,
    services: Arc<ServiceRegistry>,
}

impl From<&Context> for RequestIdentity {
    fn from(ctx: &Context) -> Self {
        RequestIdentity {
            method: ctx.method.clone(),
            path: ctx.path.clone(),
            headers: ctx.headers.clone(),
            correlation_id: ctx.correlation_id.clone(),
            services: ctx.services.clone(),
        }
    }
}

impl RequestIdentity {
    fn into_context(self) -> Context {
        Context::with_services(self.method, self.path, self.headers, self.correlation_id, self.services)
    }
}

fn write_response(mut ctx: Context, value: serde_json::Value) -> Result<Response, PortwayError> {
    ctx.response.mark_sent()?;

    let preflight = value.get("__cors_preflight").and_then(|v| v.as_bool()).unwrap_or(false);
    if preflight {
        let mut response = Response::builder().status(StatusCode::NO_CONTENT).body(Body::empty()).unwrap();
        apply_cors_preflight_headers(&mut response, &value);
        return Ok(response);
    }

    let mut response = axum::Json(value).into_response();
    if let Some(headers) = ctx.state.get::<CorsResponseHeaders>() {
        if let Ok(v) = HeaderValue::from_str(&headers.allow_origin) {
            response
                .headers_mut()
                .insert(http::header::ACCESS_CONTROL_ALLOW_ORIGIN, v);
        }
    }
    Ok(response)
}

fn apply_cors_preflight_headers(response: &mut Response, value: &serde_json::Value) {
    let headers = response.headers_mut();
    if let Some(origin) = value.get("__cors_allow_origin").and_then(|v| v.as_str()) {
        if let Ok(v) = HeaderValue::from_str(origin) {
            headers.insert(http::header::ACCESS_CONTROL_ALLOW_ORIGIN, v);
        }
    }
    if let Some(methods) = value.get("__cors_allow_methods").and_then(|v| v.as_str()) {
        if let Ok(v) = HeaderValue::from_str(methods) {
            headers.insert(http::header::ACCESS_CONTROL_ALLOW_METHODS, v);
        }
    }
    if let Some(reqh) = value.get("__cors_allow_headers").and_then(|v| v.as_str()) {
        if let Ok(v) = HeaderValue::from_str(reqh) {
            headers.insert(http::header::ACCESS_CONTROL_ALLOW_HEADERS, v);
        }
    }
}
