//! The middleware composer.
//!
//! Composes an ordered sequence of [`Middleware`] into a single chained
//! handler terminated by the route's handler shim, with cooperative
//! `next()` semantics: `pipeline(ctx) = m1(ctx, || m2(ctx, || ... handler))`.

pub mod cors;
pub mod correlation;
pub mod logger;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::context::Context;
use crate::error::{ErrorKind, PortwayError};

pub use cors::{CorsMiddleware, CorsPolicy, CorsResponseHeaders};
pub use correlation::{CorrelationMiddleware, CorrelationTag};
pub use logger::RequestLoggerMiddleware;

/// The outcome of running a composed chain: the context (possibly mutated)
/// and the handler's (or a short-circuiting middleware's) response value.
pub type ChainFuture = Pin<Box<dyn Future<Output = Result<(Context, serde_json::Value), PortwayError>> + Send>>;

/// A continuation handed to a middleware's `around`. Calling it runs the
/// rest of the chain. Rust's ownership would normally make a second call a
/// compile error (the closure is consumed); `Next` instead detects it at
/// runtime so the failure surfaces as an observable
/// `MIDDLEWARE_NEXT_CALLED_TWICE` error response, rather than a build
/// failure a user can't act on from within a route file.
#[derive(Clone)]
pub struct Next {
    inner: Arc<NextInner>,
}

struct NextInner {
    used: AtomicBool,
    rest: Box<dyn Fn(Context) -> ChainFuture + Send + Sync>,
}

impl Next {
    fn new(rest: impl Fn(Context) -> ChainFuture + Send + Sync + 'static) -> Self {
        Next {
            inner: Arc::new(NextInner {
                used: AtomicBool::new(false),
                rest: Box::new(rest),
            }),
        }
    }

    /// Run the rest of the chain. Errors with
    /// [`ErrorKind::MiddlewareNextCalledTwice`] if this handle (or a clone
    /// of it) was already invoked.
    pub async fn run(&self, ctx: Context) -> Result<(Context, serde_json::Value), PortwayError> {
        if self.inner.used.swap(true, Ordering::SeqCst) {
            return Err(PortwayError::new(
                ErrorKind::MiddlewareNextCalledTwice,
                "middleware called next() more than once",
            ));
        }
        (self.inner.rest)(ctx).await
    }
}

/// A composable request interceptor.
///
/// `around` wraps the rest of the chain: call `next.run(ctx)` to continue,
/// or return without calling it to short-circuit — any later middleware
/// and the handler then never run.
pub trait Middleware: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Whether this middleware should be bypassed for the given context, as
    /// if it were absent from the chain.
    fn skip(&self, _ctx: &Context) -> bool {
        false
    }

    /// Opt this middleware into per-invocation debug logging by the
    /// composer.
    fn debug(&self) -> bool {
        false
    }

    fn around<'a>(
        &'a self,
        ctx: Context,
        next: Next,
    ) -> Pin<Box<dyn Future<Output = Result<(Context, serde_json::Value), PortwayError>> + Send + 'a>>;
}

/// Compose `middlewares` (global ++ route, already in final order) with a
/// terminal step into one callable chain. The terminal step is itself
/// async and produces the handler's validated-and-serialized return value.
pub fn compose<T>(
    middlewares: Vec<Arc<dyn Middleware>>,
    terminal: T,
) -> impl Fn(Context) -> ChainFuture + Send + Sync + 'static
where
    T: Fn(Context) -> ChainFuture + Send + Sync + 'static,
{
    build_chain(middlewares, 0, Arc::new(terminal))
}

fn build_chain(
    middlewares: Vec<Arc<dyn Middleware>>,
    index: usize,
    terminal: Arc<dyn Fn(Context) -> ChainFuture + Send + Sync>,
) -> impl Fn(Context) -> ChainFuture + Send + Sync + 'static {
    let middlewares = Arc::new(middlewares);
    move |ctx: Context| -> ChainFuture {
        let middlewares = middlewares.clone();
        let terminal = terminal.clone();
        Box::pin(async move {
            run_from(middlewares, index, terminal, ctx).await
        })
    }
}

fn run_from(
    middlewares: Arc<Vec<Arc<dyn Middleware>>>,
    index: usize,
    terminal: Arc<dyn Fn(Context) -> ChainFuture + Send + Sync>,
    ctx: Context,
) -> ChainFuture {
    if index >= middlewares.len() {
        return terminal(ctx);
    }

    let current = middlewares[index].clone();
    if current.skip(&ctx) {
        return run_from(middlewares, index + 1, terminal, ctx);
    }

    let next_middlewares = middlewares.clone();
    let next_terminal = terminal.clone();
    let next = Next::new(move |ctx| run_from(next_middlewares.clone(), index + 1, next_terminal.clone(), ctx));

    Box::pin(async move {
        if current.debug() {
            tracing::debug!(middleware = current.name(), "entering middleware");
        }
        current.around(ctx, next).await
    })
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    pub fn never_called_next() -> Next {
        Next::new(|_ctx| -> ChainFuture { unreachable!("next should not run") })
    }

    pub fn immediate_ok_next() -> Next {
        Next::new(|ctx| -> ChainFuture {
            Box::pin(async move { Ok((ctx, serde_json::json!({"ok": true}))) })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, Method};
    use std::sync::Mutex;

    fn test_context() -> Context {
        Context::new(Method::GET, "/".to_string(), HeaderMap::new(), "corr-1".to_string())
    }

    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Middleware for Recording {
        fn name(&self) -> &str {
            self.name
        }

        fn around<'a>(
            &'a self,
            ctx: Context,
            next: Next,
        ) -> Pin<Box<dyn Future<Output = Result<(Context, serde_json::Value), PortwayError>> + Send + 'a>>
        {
            Box::pin(async move {
                self.log.lock().unwrap().push(self.name);
                next.run(ctx).await
            })
        }
    }

    struct ShortCircuit;

    impl Middleware for ShortCircuit {
        fn name(&self) -> &str {
            "short-circuit"
        }

        fn around<'a>(
            &'a self,
            ctx: Context,
            _next: Next,
        ) -> Pin<Box<dyn Future<Output = Result<(Context, serde_json::Value), PortwayError>> + Send + 'a>>
        {
            Box::pin(async move { Ok((ctx, serde_json::json!({"short": true}))) })
        }
    }

    struct CallTwice;

    impl Middleware for CallTwice {
        fn name(&self) -> &str {
            "call-twice"
        }

        fn around<'a>(
            &'a self,
            ctx: Context,
            next: Next,
        ) -> Pin<Box<dyn Future<Output = Result<(Context, serde_json::Value), PortwayError>> + Send + 'a>>
        {
            Box::pin(async move {
                let (ctx, _) = next.run(ctx).await?;
                next.run(ctx).await
            })
        }
    }

    struct AlwaysSkip;

    impl Middleware for AlwaysSkip {
        fn name(&self) -> &str {
            "always-skip"
        }

        fn skip(&self, _ctx: &Context) -> bool {
            true
        }

        fn around<'a>(
            &'a self,
            _ctx: Context,
            _next: Next,
        ) -> Pin<Box<dyn Future<Output = Result<(Context, serde_json::Value), PortwayError>> + Send + 'a>>
        {
            unreachable!("skipped middleware must never run")
        }
    }

    #[tokio::test]
    async fn executes_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let middlewares: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(Recording { name: "a", log: log.clone() }),
            Arc::new(Recording { name: "b", log: log.clone() }),
        ];
        let chain = compose(middlewares, |ctx| {
            Box::pin(async move { Ok((ctx, serde_json::json!({"ok": true}))) }) as ChainFuture
        });
        let (_, value) = chain(test_context()).await.unwrap();
        assert_eq!(value, serde_json::json!({"ok": true}));
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn short_circuit_skips_remaining_and_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let middlewares: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(ShortCircuit),
            Arc::new(Recording { name: "never", log: log.clone() }),
        ];
        let chain = compose(middlewares, |ctx| {
            Box::pin(async move { Ok((ctx, serde_json::json!({"handler": true}))) }) as ChainFuture
        });
        let (_, value) = chain(test_context()).await.unwrap();
        assert_eq!(value, serde_json::json!({"short": true}));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn calling_next_twice_errors() {
        let middlewares: Vec<Arc<dyn Middleware>> = vec![Arc::new(CallTwice)];
        let chain = compose(middlewares, |ctx| {
            Box::pin(async move { Ok((ctx, serde_json::Value::Null)) }) as ChainFuture
        });
        let err = chain(test_context()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MiddlewareNextCalledTwice);
    }

    #[tokio::test]
    async fn skip_predicate_bypasses_middleware() {
        let middlewares: Vec<Arc<dyn Middleware>> = vec![Arc::new(AlwaysSkip)];
        let chain = compose(middlewares, |ctx| {
            Box::pin(async move { Ok((ctx, serde_json::json!({"reached": true}))) }) as ChainFuture
        });
        let (_, value) = chain(test_context()).await.unwrap();
        assert_eq!(value, serde_json::json!({"reached": true}));
    }
}
