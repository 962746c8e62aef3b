//! The error taxonomy and boundary.
//!
//! Every error that can surface from the pipeline is a [`PortwayError`]
//! carrying an [`ErrorKind`]. The boundary (invoked once, at the edge of
//! the composed middleware chain — see [`crate::pipeline`]) converts it into
//! a stable JSON response and tags it with the request's correlation id.

use axum::response::{IntoResponse, Response};
use axum::Json;
use http::{HeaderValue, StatusCode};
use serde::Serialize;

/// The fixed set of error kinds the pipeline can surface to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ValidationError,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    RequestTimeout,
    Conflict,
    PayloadTooLarge,
    UnsupportedMediaType,
    UnprocessableEntity,
    RateLimited,
    InternalServerError,
    ServiceUnavailable,
    /// Not part of the wire taxonomy: signals that a route's file path
    /// could not be translated by the path parser.
    BadRoutePath,
    /// Not part of the wire taxonomy: a middleware called `next()` twice.
    MiddlewareNextCalledTwice,
    /// Not part of the wire taxonomy: graceful drain exceeded the shutdown
    /// timeout. Reported by [`crate::server::Server::run`], never sent to a
    /// client.
    ShutdownTimeout,
}

impl ErrorKind {
    /// The default HTTP status code for this kind.
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ErrorKind::RequestTimeout => StatusCode::REQUEST_TIMEOUT,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorKind::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ErrorKind::UnprocessableEntity => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::BadRoutePath => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::MiddlewareNextCalledTwice => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::ShutdownTimeout => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// The default human-readable title for this kind.
    pub fn title(self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "VALIDATION_ERROR",
            ErrorKind::Unauthorized => "UNAUTHORIZED",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ErrorKind::RequestTimeout => "REQUEST_TIMEOUT",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ErrorKind::UnsupportedMediaType => "UNSUPPORTED_MEDIA_TYPE",
            ErrorKind::UnprocessableEntity => "UNPROCESSABLE_ENTITY",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::InternalServerError => "INTERNAL_SERVER_ERROR",
            ErrorKind::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorKind::BadRoutePath => "BAD_ROUTE_PATH",
            ErrorKind::MiddlewareNextCalledTwice => "MIDDLEWARE_NEXT_CALLED_TWICE",
            ErrorKind::ShutdownTimeout => "SHUTDOWN_TIMEOUT",
        }
    }
}

/// The pipeline's single error type. Produced by the matcher, the
/// validation gate, middleware, handlers, and the plugin lifecycle manager,
/// and consumed exactly once at the error boundary.
#[derive(Debug, Clone)]
pub struct PortwayError {
    kind: ErrorKind,
    message: String,
    correlation_id: Option<String>,
    details: Option<serde_json::Value>,
    allow: Option<String>,
    retry_after: Option<u64>,
}

impl PortwayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        PortwayError {
            kind,
            message: message.into(),
            correlation_id: None,
            details: None,
            allow: None,
            retry_after: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Attach the `Allow` header value for a 405 response.
    pub fn with_allow(mut self, allowed: impl Into<String>) -> Self {
        self.allow = Some(allowed.into());
        self
    }

    /// Attach a `Retry-After` value in seconds (429 / 503 responses).
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    /// Tag this error with a correlation id, but only if it doesn't already
    /// carry one — the boundary "tags it with the current correlation id if
    /// missing".
    pub fn tag_correlation_id(&mut self, id: &str) {
        if self.correlation_id.is_none() {
            self.correlation_id = Some(id.to_string());
        }
    }

    pub fn not_found() -> Self {
        PortwayError::new(ErrorKind::NotFound, "route not found")
    }

    pub fn method_not_allowed(allowed: impl Into<String>) -> Self {
        PortwayError::new(ErrorKind::MethodNotAllowed, "method not allowed").with_allow(allowed)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        PortwayError::new(ErrorKind::InternalServerError, message)
    }

    /// Demote any error to `INTERNAL_SERVER_ERROR` with a sanitized public
    /// message, preserving the original for logging by the caller.
    pub fn sanitized_internal(original: &dyn std::fmt::Display) -> Self {
        tracing::error!(error = %original, "response serialization failed, sanitizing");
        PortwayError::new(
            ErrorKind::InternalServerError,
            "an internal error occurred",
        )
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    title: &'a str,
    status: u16,
    #[serde(rename = "correlationId", skip_serializing_if = "Option::is_none")]
    correlation_id: Option<&'a str>,
    timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a serde_json::Value>,
}

impl IntoResponse for PortwayError {
    fn into_response(self) -> Response {
        let status = self.kind.status();
        let body = ErrorBody {
            kind: self.kind.title(),
            title: self.kind.title(),
            status: status.as_u16(),
            correlation_id: self.correlation_id.as_deref(),
            timestamp: crate::context::now_rfc3339(),
            details: self.details.as_ref(),
        };
        let mut response = (status, Json(body)).into_response();
        if let Some(allow) = &self.allow {
            if let Ok(value) = HeaderValue::from_str(allow) {
                response.headers_mut().insert(http::header::ALLOW, value);
            }
        }
        if let Some(seconds) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert(http::header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl std::fmt::Display for PortwayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.title(), self.message)
    }
}

impl std::error::Error for PortwayError {}

impl From<std::io::Error> for PortwayError {
    fn from(err: std::io::Error) -> Self {
        PortwayError::internal(err.to_string())
    }
}

crate::map_error! {
    crate::config::ConfigError => InternalServerError,
    notify::Error => InternalServerError,
}

/// Generate `From<E> for PortwayError` implementations that map error types
/// to a specific [`ErrorKind`].
///
/// ```ignore
/// portway_core::map_error! {
///     garde::Report => ValidationError,
///     std::io::Error => InternalServerError,
/// }
/// ```
#[macro_export]
macro_rules! map_error {
    ( $( $err_ty:ty => $kind:ident ),* $(,)? ) => {
        $(
            impl From<$err_ty> for $crate::PortwayError {
                fn from(err: $err_ty) -> Self {
                    $crate::PortwayError::new($crate::ErrorKind::$kind, err.to_string())
                }
            }
        )*
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn error_parts(err: PortwayError) -> (StatusCode, serde_json::Value) {
        let resp = err.into_response();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        (status, json)
    }

    #[tokio::test]
    async fn not_found_has_envelope_fields() {
        let (status, body) = error_parts(PortwayError::not_found()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["type"], "NOT_FOUND");
        assert_eq!(body["status"], 404);
        assert!(body.get("timestamp").is_some());
        assert!(body.get("correlationId").is_none());
    }

    #[tokio::test]
    async fn method_not_allowed_sets_allow_header() {
        let err = PortwayError::method_not_allowed("GET, HEAD");
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(resp.headers().get(http::header::ALLOW).unwrap(), "GET, HEAD");
    }

    #[tokio::test]
    async fn details_are_included_when_present() {
        let err = PortwayError::new(ErrorKind::ValidationError, "bad body")
            .with_details(serde_json::json!({"fields": [{"field": "email"}]}));
        let (_, body) = error_parts(err).await;
        assert_eq!(body["details"]["fields"][0]["field"], "email");
    }

    #[tokio::test]
    async fn details_omitted_when_absent() {
        let (_, body) = error_parts(PortwayError::internal("boom")).await;
        assert!(body.get("details").is_none());
    }

    #[test]
    fn correlation_id_only_set_if_missing() {
        let mut err = PortwayError::not_found();
        err.tag_correlation_id("first");
        err.tag_correlation_id("second");
        assert_eq!(err.correlation_id.as_deref(), Some("first"));
    }

    #[test]
    fn rate_limited_carries_retry_after() {
        let err = PortwayError::new(ErrorKind::RateLimited, "slow down").with_retry_after(30);
        assert_eq!(err.retry_after, Some(30));
    }

    #[test]
    fn from_io_error_is_internal() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let app_err: PortwayError = io_err.into();
        assert_eq!(app_err.kind(), ErrorKind::InternalServerError);
    }

    #[derive(Debug)]
    struct Throttled;

    impl std::fmt::Display for Throttled {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "throttled")
        }
    }

    crate::map_error! { Throttled => RateLimited }

    #[test]
    fn map_error_generates_from_impls() {
        let err: PortwayError = Throttled.into();
        assert_eq!(err.kind(), ErrorKind::RateLimited);
    }
}
