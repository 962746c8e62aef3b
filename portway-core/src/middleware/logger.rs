//! Request logging middleware, prepended to every chain when
//! `logging.request_logging` is enabled (the default).
//!
//! Emits one event per request at completion carrying method, path,
//! outcome, and elapsed time. Failures are logged here at `warn` with the
//! error kind; the error boundary still owns translating them to a wire
//! response.

use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

use crate::context::Context;
use crate::error::PortwayError;

use super::Next;

pub struct RequestLoggerMiddleware;

impl super::Middleware for RequestLoggerMiddleware {
    fn name(&self) -> &str {
        "request-logger"
    }

    fn around<'a>(
        &'a self,
        ctx: Context,
        next: Next,
    ) -> Pin<Box<dyn Future<Output = Result<(Context, serde_json::Value), PortwayError>> + Send + 'a>>
    {
        Box::pin(async move {
            let method = ctx.method.clone();
            let path = ctx.path.clone();
            let correlation_id = ctx.correlation_id.clone();
            let started = Instant::now();

            let outcome = next.run(ctx).await;

            let elapsed_ms = started.elapsed().as_millis() as u64;
            match &outcome {
                Ok(_) => {
                    tracing::info!(
                        method = %method,
                        path = %path,
                        duration_ms = elapsed_ms,
                        correlation_id = %correlation_id,
                        "request handled"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        method = %method,
                        path = %path,
                        duration_ms = elapsed_ms,
                        correlation_id = %correlation_id,
                        kind = err.kind().title(),
                        "request failed in chain"
                    );
                }
            }
            outcome
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::Middleware;
    use http::{HeaderMap, Method};

    #[tokio::test]
    async fn passes_the_chain_outcome_through() {
        let middleware = RequestLoggerMiddleware;
        let ctx = Context::new(Method::GET, "/".to_string(), HeaderMap::new(), "c1".to_string());
        let next = crate::middleware::tests_support::immediate_ok_next();
        let (_, value) = middleware.around(ctx, next).await.unwrap();
        assert_eq!(value, serde_json::json!({"ok": true}));
    }
}
