//! Server configuration: the recognized options, their defaults, and their
//! projection from [`crate::config::PortwayConfig`].

use garde::Validate;

use crate::body::MultipartLimits;
use crate::config::{ConfigError, ConfigProperties, PortwayConfig};
use crate::middleware::CorsPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeEnv {
    Development,
    Production,
    Test,
}

impl RuntimeEnv {
    pub fn from_env() -> Self {
        match std::env::var("PORTWAY_ENV").as_deref() {
            Ok("production") => RuntimeEnv::Production,
            Ok("test") => RuntimeEnv::Test,
            _ => RuntimeEnv::Development,
        }
    }

    pub fn is_development(self) -> bool {
        matches!(self, RuntimeEnv::Development)
    }
}

#[derive(Debug, Clone, Validate)]
pub struct Http2Options {
    #[garde(skip)]
    pub enabled: bool,
    #[garde(skip)]
    pub key_file: Option<String>,
    #[garde(skip)]
    pub cert_file: Option<String>,
}

impl Default for Http2Options {
    fn default() -> Self {
        Http2Options { enabled: true, key_file: None, cert_file: None }
    }
}

#[derive(Debug, Clone, Validate)]
pub struct BodyLimitOptions {
    #[garde(range(min = 1))]
    pub json: usize,
    #[garde(range(min = 1))]
    pub form: usize,
    #[garde(range(min = 1))]
    pub text: usize,
    #[garde(range(min = 1))]
    pub raw: usize,
    #[garde(custom(multipart_caps_nonzero))]
    pub multipart: MultipartLimits,
}

fn multipart_caps_nonzero(limits: &MultipartLimits, _ctx: &()) -> garde::Result {
    let caps = [
        limits.max_file_size,
        limits.max_total_size,
        limits.max_files,
        limits.max_field_size,
    ];
    if caps.contains(&0) {
        return Err(garde::Error::new("every multipart cap must be greater than 0"));
    }
    Ok(())
}

impl Default for BodyLimitOptions {
    fn default() -> Self {
        let defaults = crate::body::BodyLimits::default();
        BodyLimitOptions {
            json: defaults.json,
            form: defaults.form,
            text: defaults.text,
            raw: defaults.raw,
            multipart: defaults.multipart,
        }
    }
}

impl From<BodyLimitOptions> for crate::body::BodyLimits {
    fn from(options: BodyLimitOptions) -> Self {
        crate::body::BodyLimits {
            json: options.json,
            form: options.form,
            text: options.text,
            raw: options.raw,
            multipart: options.multipart,
        }
    }
}

/// Request/response logging knobs (`logging.*` in the config file).
#[derive(Debug, Clone, Validate)]
pub struct LoggingOptions {
    /// Overrides the profile-derived default filter when set.
    #[garde(skip)]
    pub level: Option<String>,
    /// Whether the baked-in request logger middleware is prepended.
    #[garde(skip)]
    pub request_logging: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        LoggingOptions { level: None, request_logging: true }
    }
}

/// The validated, explicit server configuration: the Rust-idiomatic
/// replacement for the structurally-typed options object of the source
/// system.
#[derive(Debug, Clone, Validate)]
pub struct ServerOptions {
    #[garde(skip)]
    pub port: u16,
    #[garde(length(min = 1))]
    pub host: String,
    #[garde(skip)]
    pub routes_dir: String,
    #[garde(dive)]
    pub http2: Http2Options,
    #[garde(dive)]
    pub body_limits: BodyLimitOptions,
    #[garde(skip)]
    pub correlation_header: String,
    #[garde(skip)]
    pub cors: Option<CorsPolicy>,
    #[garde(dive)]
    pub logging: LoggingOptions,
    #[garde(skip)]
    pub env: RuntimeEnv,
    #[garde(range(min = 1))]
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            port: 3000,
            host: "localhost".to_string(),
            routes_dir: "routes".to_string(),
            http2: Http2Options::default(),
            body_limits: BodyLimitOptions::default(),
            correlation_header: "x-correlation-id".to_string(),
            cors: None,
            logging: LoggingOptions::default(),
            env: RuntimeEnv::from_env(),
            shutdown_timeout_secs: 30,
        }
    }
}

impl ConfigProperties for ServerOptions {
    fn prefix() -> &'static str {
        "server"
    }

    fn from_config(config: &PortwayConfig) -> Result<Self, ConfigError> {
        let mut options = ServerOptions::default();

        options.port = config.get_or("server.port", options.port);
        if let Ok(host) = config.get::<String>("server.host") {
            options.host = host;
        }
        if let Ok(dir) = config.get::<String>("server.routes_dir") {
            options.routes_dir = dir;
        }

        options.http2.enabled = config.get_or("server.http2.enabled", options.http2.enabled);
        options.http2.key_file = config.get::<String>("server.http2.key_file").ok();
        options.http2.cert_file = config.get::<String>("server.http2.cert_file").ok();

        let limits = &mut options.body_limits;
        limits.json = config.get_or("server.body_limits.json", limits.json);
        limits.form = config.get_or("server.body_limits.form", limits.form);
        limits.text = config.get_or("server.body_limits.text", limits.text);
        limits.raw = config.get_or("server.body_limits.raw", limits.raw);
        let multipart = &mut limits.multipart;
        multipart.max_file_size =
            config.get_or("server.body_limits.multipart.max_file_size", multipart.max_file_size);
        multipart.max_total_size =
            config.get_or("server.body_limits.multipart.max_total_size", multipart.max_total_size);
        multipart.max_files = config.get_or("server.body_limits.multipart.max_files", multipart.max_files);
        multipart.max_field_size =
            config.get_or("server.body_limits.multipart.max_field_size", multipart.max_field_size);

        if let Ok(header) = config.get::<String>("server.correlation.header_name") {
            options.correlation_header = header;
        }
        options.shutdown_timeout_secs =
            config.get_or("server.shutdown_timeout_secs", options.shutdown_timeout_secs);

        options.cors = cors_from_config(config);

        options.logging.level = config.get::<String>("logging.level").ok();
        options.logging.request_logging =
            config.get_or("logging.request_logging", options.logging.request_logging);

        Ok(options)
    }
}

/// A `cors:` section with any recognized key enables the CORS middleware;
/// a config without one leaves it uninstalled.
fn cors_from_config(config: &PortwayConfig) -> Option<CorsPolicy> {
    if config.get_or("cors.enabled", false) {
        let mut policy = CorsPolicy::permissive();
        if let Ok(origins) = config.get::<Vec<String>>("cors.allowed_origins") {
            policy.allowed_origins = origins;
        }
        if let Ok(methods) = config.get::<Vec<String>>("cors.allowed_methods") {
            policy.allowed_methods = methods;
        }
        if let Ok(headers) = config.get::<Vec<String>>("cors.allowed_headers") {
            policy.allowed_headers = headers;
        }
        return Some(policy);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        assert!(ServerOptions::default().validate().is_ok());
    }

    #[test]
    fn empty_host_fails_validation() {
        let mut options = ServerOptions::default();
        options.host = String::new();
        assert!(options.validate().is_err());
    }

    #[test]
    fn zero_multipart_cap_fails_validation() {
        let mut options = ServerOptions::default();
        options.body_limits.multipart.max_files = 0;
        assert!(options.validate().is_err());
    }

    #[test]
    fn from_config_reads_overrides() {
        let config = PortwayConfig::from_yaml_str(
            "server:\n  port: 8080\n  host: 0.0.0.0\n  body_limits:\n    json: 2048\n",
            "test",
        )
        .unwrap();
        let options = ServerOptions::from_config(&config).unwrap();
        assert_eq!(options.port, 8080);
        assert_eq!(options.host, "0.0.0.0");
        assert_eq!(options.body_limits.json, 2048);
        assert!(options.cors.is_none());
    }

    #[test]
    fn cors_section_installs_a_policy() {
        let config = PortwayConfig::from_yaml_str(
            "cors:\n  enabled: true\n  allowed_origins:\n    - https://app.example\n",
            "test",
        )
        .unwrap();
        let options = ServerOptions::from_config(&config).unwrap();
        let cors = options.cors.expect("cors policy");
        assert_eq!(cors.allowed_origins, vec!["https://app.example"]);
    }

    #[test]
    fn logging_section_toggles_request_logging() {
        let config = PortwayConfig::from_yaml_str(
            "logging:\n  level: warn\n  request_logging: false\n",
            "test",
        )
        .unwrap();
        let options = ServerOptions::from_config(&config).unwrap();
        assert_eq!(options.logging.level.as_deref(), Some("warn"));
        assert!(!options.logging.request_logging);
    }
}
