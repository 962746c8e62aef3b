//! `GET /health` — liveness probe reporting the binary's identity via the
//! service the app-info plugin installed.

use portway_core::{Context, RouteMethod};

use crate::plugins::AppInfo;

pub fn register() {
    portway_core::register_route!("health.rs", GET, || RouteMethod::new(handler));
}

async fn handler(ctx: Context) -> Result<serde_json::Value, portway_core::PortwayError> {
    let app = ctx.services.get::<AppInfo>();
    Ok(serde_json::json!({
        "status": "ok",
        "name": app.as_deref().map(|info| info.name),
        "version": app.as_deref().map(|info| info.version),
    }))
}
