//! Structured logging setup.
//!
//! Call [`init`] once, at the very start of `main`, before any `tracing`
//! macro fires.

use tracing_subscriber::EnvFilter;

use crate::server::RuntimeEnv;

/// Initialize the global `tracing` subscriber.
///
/// Filter precedence: `RUST_LOG`, then the configured `logging.level`,
/// then `debug` in development / `info` elsewhere. Production uses
/// JSON-formatted output suitable for log aggregation; development and
/// test use the human-readable `fmt` layer.
pub fn init(env: RuntimeEnv, level: Option<&str>) {
    let fallback = level.unwrap_or(if env.is_development() { "debug" } else { "info" });
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| fallback.parse())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match env {
        RuntimeEnv::Production => subscriber.json().init(),
        RuntimeEnv::Development | RuntimeEnv::Test => subscriber.init(),
    }
}
