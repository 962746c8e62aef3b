//! The route data model: a path maps to a set of per-method handlers,
//! each with its own middleware, schema, and options.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use http::Method;

use crate::context::Context;
use crate::error::PortwayError;
use crate::middleware::Middleware;
use crate::validation::{FileSchema, SchemaValidator};

/// Boxed future returned by a handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value, PortwayError>> + Send>>;

/// A route handler: takes the fully-built, validated [`Context`] and
/// produces a value that is validated against the response schema (if any)
/// and serialized. The handler consumes the context; any response headers a
/// wrapping middleware wants to attach after the handler returns are
/// recorded against a fresh context the pipeline reconstructs from the
/// original request's identity (see `pipeline::terminal`), not against
/// `ctx.state` the handler itself populated.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, ctx: Context) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, PortwayError>> + Send + 'static,
{
    fn call(&self, ctx: Context) -> HandlerFuture {
        Box::pin((self)(ctx))
    }
}

/// The four validation points a route may declare a schema for, plus
/// per-field constraints on multipart file uploads.
#[derive(Default, Clone)]
pub struct RouteSchema {
    pub params: Option<Arc<dyn SchemaValidator>>,
    pub query: Option<Arc<dyn SchemaValidator>>,
    pub body: Option<Arc<dyn SchemaValidator>>,
    pub response: Option<Arc<dyn SchemaValidator>>,
    pub files: HashMap<String, FileSchema>,
}

/// Everything registered for one `(path, method)` pair.
#[derive(Clone)]
pub struct RouteMethod {
    pub handler: Arc<dyn Handler>,
    pub middleware: Vec<Arc<dyn Middleware>>,
    pub schema: RouteSchema,
    pub options: serde_json::Value,
}

impl RouteMethod {
    pub fn new(handler: impl Handler) -> Self {
        RouteMethod {
            handler: Arc::new(handler),
            middleware: Vec::new(),
            schema: RouteSchema::default(),
            options: serde_json::Value::Null,
        }
    }

    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn with_schema(mut self, schema: RouteSchema) -> Self {
        self.schema = schema;
        self
    }
}

/// A canonical path with a handler per HTTP method.
#[derive(Clone, Default)]
pub struct Route {
    pub path: String,
    pub methods: HashMap<Method, RouteMethod>,
}

impl Route {
    pub fn new(path: impl Into<String>) -> Self {
        Route {
            path: path.into(),
            methods: HashMap::new(),
        }
    }

    pub fn insert(&mut self, method: Method, route_method: RouteMethod) {
        self.methods.insert(method, route_method);
    }

    pub fn allowed_methods(&self) -> String {
        let mut methods: Vec<&str> = self.methods.keys().map(Method::as_str).collect();
        methods.sort_unstable();
        methods.join(", ")
    }
}
