//! The per-request context and correlation id.
//!
//! A [`Context`] is created once by the pipeline on accept and lives exactly
//! as long as the in-flight request. It is owned exclusively by the task
//! handling that request; no other task reads it after the response is
//! written. The correlation id is additionally published to a task-local
//! slot so code several calls deep (logging, error construction) can read
//! it without an explicit parameter.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use http::{HeaderMap, Method};

use crate::error::{ErrorKind, PortwayError};

tokio::task_local! {
    static CORRELATION_ID: String;
}

/// The correlation id configuration: which header to read/write, and how to
/// generate one when the header is absent or malformed.
#[derive(Clone)]
pub struct CorrelationId {
    pub header_name: String,
    pub generator: fn() -> String,
}

impl Default for CorrelationId {
    fn default() -> Self {
        CorrelationId {
            header_name: "x-correlation-id".to_string(),
            generator: generate,
        }
    }
}

impl CorrelationId {
    /// Derive the correlation id for one request: read the configured
    /// header if present and well-formed, otherwise generate one.
    pub fn derive(&self, headers: &HeaderMap) -> String {
        if let Some(value) = headers.get(&self.header_name) {
            if let Ok(raw) = value.to_str() {
                let trimmed = raw.trim();
                let valid = !trimmed.is_empty()
                    && trimmed.len() <= 128
                    && trimmed.chars().all(|c| !c.is_control());
                if valid {
                    return trimmed.to_string();
                }
            }
        }
        (self.generator)()
    }

    /// Run `f` with the given correlation id published to the task-local
    /// slot, so [`current`] resolves inside it.
    pub async fn scope<F, T>(id: String, f: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        CORRELATION_ID.scope(id, f).await
    }
}

/// Generate a fresh correlation id: 128 bits of randomness, hex-encoded.
pub fn generate() -> String {
    let bytes: [u8; 16] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Read the correlation id of the request currently being handled on this
/// task, if any. Returns `None` outside of a [`CorrelationId::scope`] call.
pub fn current() -> Option<String> {
    CORRELATION_ID.try_with(|id| id.clone()).ok()
}

/// Current time as an RFC 3339 timestamp, used in the error envelope.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// A type-erased, single-value-per-type map used for the context's
/// per-request `state` slot.
#[derive(Default)]
pub struct TypeMap {
    inner: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl TypeMap {
    pub fn new() -> Self {
        TypeMap::default()
    }

    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) {
        self.inner.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.inner
            .get(&TypeId::of::<T>())
            .and_then(|b| b.downcast_ref::<T>())
    }

    pub fn get_mut<T: Send + Sync + 'static>(&mut self) -> Option<&mut T> {
        self.inner
            .get_mut(&TypeId::of::<T>())
            .and_then(|b| b.downcast_mut::<T>())
    }

    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.inner.contains_key(&TypeId::of::<T>())
    }
}

/// The process-wide service registry: capabilities installed by plugins
/// during `register`/`initialize` and read by handlers and middleware via
/// [`Context::services`]. Values are stored behind `Arc` so a request can
/// hold a service reference past the lock without cloning the service
/// itself.
#[derive(Default)]
pub struct ServiceRegistry {
    inner: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        ServiceRegistry::default()
    }

    pub fn install<T: Send + Sync + 'static>(&self, service: T) {
        self.inner
            .write()
            .unwrap()
            .insert(TypeId::of::<T>(), Arc::new(service));
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.inner
            .read()
            .unwrap()
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|any| any.downcast::<T>().ok())
    }

    /// Remove a service, returning whether it was present. Plugins call
    /// this from `terminate` to release what they installed.
    pub fn remove<T: Send + Sync + 'static>(&self) -> bool {
        self.inner.write().unwrap().remove(&TypeId::of::<T>()).is_some()
    }
}

/// Tracks whether the response has already been sent, enforcing "exactly
/// one terminal send per request" from the data model.
#[derive(Default)]
pub struct ResponseSlot {
    sent: bool,
}

impl ResponseSlot {
    /// Mark the response as sent. Returns an error if it was already sent.
    pub fn mark_sent(&mut self) -> Result<(), PortwayError> {
        if self.sent {
            return Err(PortwayError::new(
                ErrorKind::InternalServerError,
                "response already sent for this request",
            ));
        }
        self.sent = true;
        Ok(())
    }

    pub fn is_sent(&self) -> bool {
        self.sent
    }
}

/// The per-request context: request view, mutable state, mutable services,
/// and the correlation id. Created by the pipeline on accept, consumed by
/// the middleware chain, the handler, and the error boundary.
pub struct Context {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    /// Populated by the matcher before the chain runs.
    pub params: HashMap<String, String>,
    /// Parsed from the query string; each key may have multiple values.
    pub query: HashMap<String, Vec<String>>,
    /// The raw request body, decoded once the content-type is known.
    pub body: Bytes,
    pub state: TypeMap,
    /// Plugin-installed capabilities, shared across requests.
    pub services: Arc<ServiceRegistry>,
    pub correlation_id: String,
    pub response: ResponseSlot,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("params", &self.params)
            .field("query", &self.query)
            .field("correlation_id", &self.correlation_id)
            .finish_non_exhaustive()
    }
}

impl Context {
    pub fn new(method: Method, path: String, headers: HeaderMap, correlation_id: String) -> Self {
        Context::with_services(method, path, headers, correlation_id, Arc::new(ServiceRegistry::new()))
    }

    pub fn with_services(
        method: Method,
        path: String,
        headers: HeaderMap,
        correlation_id: String,
        services: Arc<ServiceRegistry>,
    ) -> Self {
        Context {
            method,
            path,
            headers,
            params: HashMap::new(),
            query: HashMap::new(),
            body: Bytes::new(),
            state: TypeMap::new(),
            services,
            correlation_id,
            response: ResponseSlot::default(),
        }
    }
}

/// Parse a raw query string into a multi-valued map.
pub fn parse_query(raw: Option<&str>) -> HashMap<String, Vec<String>> {
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    let Some(raw) = raw else { return out };
    for (key, value) in form_urlencoded::parse(raw.as_bytes()) {
        out.entry(key.into_owned()).or_default().push(value.into_owned());
    }
    out
}

/// Project the query multi-map into the JSON shape the validation gate
/// consumes: keys with a single value become strings, repeated keys become
/// arrays, so a schema can declare `q: String` without caring that the
/// wire format is always multi-valued.
pub fn query_to_json(query: &HashMap<String, Vec<String>>) -> serde_json::Value {
    let mut object = serde_json::Map::new();
    for (key, values) in query {
        let value = match values.as_slice() {
            [single] => serde_json::Value::String(single.clone()),
            many => serde_json::Value::Array(
                many.iter().cloned().map(serde_json::Value::String).collect(),
            ),
        };
        object.insert(key.clone(), value);
    }
    serde_json::Value::Object(object)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_id_read_from_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-correlation-id", "abc-123".parse().unwrap());
        let cfg = CorrelationId::default();
        assert_eq!(cfg.derive(&headers), "abc-123");
    }

    #[test]
    fn correlation_id_generated_when_absent() {
        let headers = HeaderMap::new();
        let cfg = CorrelationId::default();
        let id = cfg.derive(&headers);
        assert_eq!(id.len(), 32);
    }

    #[test]
    fn correlation_id_rejects_control_characters() {
        let mut headers = HeaderMap::new();
        // A header value cannot literally contain a control byte and still
        // parse with `to_str`, so this exercises the trimmed-empty path.
        headers.insert("x-correlation-id", "   ".parse().unwrap());
        let cfg = CorrelationId::default();
        let id = cfg.derive(&headers);
        assert_eq!(id.len(), 32);
    }

    #[test]
    fn correlation_id_bounded_to_128_bytes() {
        let mut headers = HeaderMap::new();
        let long = "a".repeat(200);
        headers.insert("x-correlation-id", long.parse().unwrap());
        let cfg = CorrelationId::default();
        let id = cfg.derive(&headers);
        assert_eq!(id.len(), 32);
    }

    #[test]
    fn custom_generator_is_used_when_header_absent() {
        fn fixed() -> String {
            "generated-by-test".to_string()
        }
        let cfg = CorrelationId { header_name: "x-trace".to_string(), generator: fixed };
        assert_eq!(cfg.derive(&HeaderMap::new()), "generated-by-test");
    }

    #[tokio::test]
    async fn correlation_id_scope_is_readable_within() {
        assert!(current().is_none());
        CorrelationId::scope("req-1".to_string(), async {
            assert_eq!(current().as_deref(), Some("req-1"));
        })
        .await;
        assert!(current().is_none());
    }

    #[test]
    fn type_map_round_trips_distinct_types() {
        let mut map = TypeMap::new();
        map.insert(42i32);
        map.insert("hello".to_string());
        assert_eq!(map.get::<i32>(), Some(&42));
        assert_eq!(map.get::<String>(), Some(&"hello".to_string()));
        assert!(map.get::<f64>().is_none());
    }

    #[test]
    fn response_slot_rejects_double_send() {
        let mut slot = ResponseSlot::default();
        slot.mark_sent().unwrap();
        let err = slot.mark_sent().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InternalServerError);
    }

    #[test]
    fn parse_query_collects_multi_values() {
        let query = parse_query(Some("a=1&a=2&b=3"));
        assert_eq!(query.get("a").unwrap(), &vec!["1".to_string(), "2".to_string()]);
        assert_eq!(query.get("b").unwrap(), &vec!["3".to_string()]);
    }

    #[test]
    fn parse_query_handles_absent_query() {
        assert!(parse_query(None).is_empty());
    }

    #[test]
    fn query_json_flattens_single_values() {
        let query = parse_query(Some("q=hello&tag=a&tag=b"));
        let json = query_to_json(&query);
        assert_eq!(json["q"], "hello");
        assert_eq!(json["tag"], serde_json::json!(["a", "b"]));
    }

    #[test]
    fn service_registry_installs_and_removes() {
        struct Mailer {
            from: &'static str,
        }
        let services = ServiceRegistry::new();
        services.install(Mailer { from: "noreply@example.com" });
        assert_eq!(services.get::<Mailer>().unwrap().from, "noreply@example.com");
        assert!(services.remove::<Mailer>());
        assert!(services.get::<Mailer>().is_none());
    }
}
