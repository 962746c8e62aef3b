//! CORS middleware.
//!
//! Adds `Access-Control-Allow-*` headers per the configured policy and
//! short-circuits `OPTIONS` preflight requests with `204 No Content`.
//! Installed only when a [`CorsPolicy`] is configured (`cors: false` in
//! server options means this middleware is simply absent from the chain).

use std::future::Future;
use std::pin::Pin;

use http::{HeaderValue, Method};

use crate::context::Context;
use crate::error::PortwayError;

use super::Next;

/// A CORS policy: the set of origins, methods, and headers the server will
/// advertise as allowed.
#[derive(Debug, Clone)]
pub struct CorsPolicy {
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
}

impl CorsPolicy {
    /// A development-friendly policy allowing any origin/method/header.
    pub fn permissive() -> Self {
        CorsPolicy {
            allowed_origins: vec!["*".to_string()],
            allowed_methods: vec!["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            allowed_headers: vec!["*".to_string()],
        }
    }

    fn origin_header(&self, request_origin: Option<&str>) -> Option<HeaderValue> {
        if self.allowed_origins.iter().any(|o| o == "*") {
            return HeaderValue::from_str("*").ok();
        }
        let origin = request_origin?;
        if self.allowed_origins.iter().any(|o| o == origin) {
            HeaderValue::from_str(origin).ok()
        } else {
            None
        }
    }
}

pub struct CorsMiddleware {
    policy: CorsPolicy,
}

impl CorsMiddleware {
    pub fn new(policy: CorsPolicy) -> Self {
        CorsMiddleware { policy }
    }
}

impl super::Middleware for CorsMiddleware {
    fn name(&self) -> &str {
        "cors"
    }

    fn around<'a>(
        &'a self,
        ctx: Context,
        next: Next,
    ) -> Pin<Box<dyn Future<Output = Result<(Context, serde_json::Value), PortwayError>> + Send + 'a>>
    {
        Box::pin(async move {
            let request_origin = ctx
                .headers
                .get(http::header::ORIGIN)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);

            if ctx.method == Method::OPTIONS {
                let mut response = serde_json::json!({});
                if let Some(value) = self.policy.origin_header(request_origin.as_deref()) {
                    response["__cors_allow_origin"] =
                        serde_json::Value::String(value.to_str().unwrap_or("*").to_string());
                }
                response["__cors_preflight"] = serde_json::Value::Bool(true);
                response["__cors_allow_methods"] =
                    serde_json::Value::String(self.policy.allowed_methods.join(", "));
                response["__cors_allow_headers"] =
                    serde_json::Value::String(self.policy.allowed_headers.join(", "));
                return Ok((ctx, response));
            }

            let (mut ctx, value) = next.run(ctx).await?;
            if let Some(value) = self.policy.origin_header(request_origin.as_deref()) {
                ctx.state.insert(CorsResponseHeaders {
                    allow_origin: value.to_str().unwrap_or("*").to_string(),
                });
            }
            Ok((ctx, value))
        })
    }
}

/// Stashed in [`Context::state`] by [`CorsMiddleware`] so the pipeline's
/// response-writing step can attach the `Access-Control-Allow-Origin`
/// header to the real HTTP response.
pub struct CorsResponseHeaders {
    pub allow_origin: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{ChainFuture, Middleware};
    use http::{HeaderMap, Method};

    fn ctx_with_method(method: Method) -> Context {
        Context::new(method, "/".to_string(), HeaderMap::new(), "c1".to_string())
    }

    #[tokio::test]
    async fn options_preflight_short_circuits() {
        let middleware = CorsMiddleware::new(CorsPolicy::permissive());
        let next = crate::middleware::tests_support::never_called_next();
        let (_, value) = middleware.around(ctx_with_method(Method::OPTIONS), next).await.unwrap();
        assert_eq!(value["__cors_preflight"], true);
    }

    #[tokio::test]
    async fn non_preflight_passes_through_to_next() {
        let middleware = CorsMiddleware::new(CorsPolicy::permissive());
        let next = crate::middleware::tests_support::immediate_ok_next();
        let (ctx, value) = middleware.around(ctx_with_method(Method::GET), next).await.unwrap();
        assert_eq!(value, serde_json::json!({"ok": true}));
        assert!(ctx.state.get::<CorsResponseHeaders>().is_some());
    }

    #[test]
    fn exact_origin_allowed_when_listed() {
        let policy = CorsPolicy {
            allowed_origins: vec!["https://example.com".to_string()],
            allowed_methods: vec!["GET".to_string()],
            allowed_headers: vec![],
        };
        assert!(policy.origin_header(Some("https://example.com")).is_some());
        assert!(policy.origin_header(Some("https://evil.example")).is_none());
    }
}
