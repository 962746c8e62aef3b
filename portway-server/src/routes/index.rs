//! `GET /` — the root route.

pub fn register() {
    portway_core::register_route!("index.rs", GET, || {
        portway_core::RouteMethod::new(|_ctx| async move { Ok(serde_json::json!({ "ok": true })) })
    });
}
