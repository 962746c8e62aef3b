//! Layered server configuration.
//!
//! Configuration is assembled from, lowest precedence first: a base
//! `application.yaml`, a profile overlay (`application-{profile}.yaml`),
//! `.env` / `.env.{profile}` files, and finally process environment
//! variables (`SERVER_PORT` overrides `server.port`). The YAML tree is
//! flattened into dot-separated keys so every layer writes into the same
//! flat map. String values may embed `${...}` placeholders resolved
//! through a pluggable [`SecretResolver`].
//!
//! The active profile is `PORTWAY_PROFILE` when set, otherwise the value
//! passed to [`PortwayConfig::load`].

use std::collections::HashMap;
use std::path::Path;

/// Error raised while loading or reading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// The requested key is absent from every layer.
    Missing(String),
    /// The key exists but its value cannot convert to the requested type.
    TypeMismatch { key: String, expected: &'static str },
    /// An I/O, YAML, or placeholder-resolution failure.
    Load(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Missing(key) => write!(f, "missing config key '{key}'"),
            ConfigError::TypeMismatch { key, expected } => {
                write!(f, "config key '{key}' is not a {expected}")
            }
            ConfigError::Load(msg) => write!(f, "config load failed: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// One flattened configuration value.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
    List(Vec<ConfigValue>),
}

impl ConfigValue {
    fn from_yaml(value: &serde_yaml::Value) -> Self {
        match value {
            serde_yaml::Value::Bool(b) => ConfigValue::Bool(*b),
            serde_yaml::Value::String(s) => ConfigValue::Str(s.clone()),
            serde_yaml::Value::Null => ConfigValue::Null,
            serde_yaml::Value::Number(n) => match n.as_i64() {
                Some(i) => ConfigValue::Int(i),
                None => ConfigValue::Float(n.as_f64().unwrap_or(0.0)),
            },
            serde_yaml::Value::Sequence(items) => {
                ConfigValue::List(items.iter().map(ConfigValue::from_yaml).collect())
            }
            other => ConfigValue::Str(format!("{other:?}")),
        }
    }
}

/// Conversion from a [`ConfigValue`] into a concrete type. Values that
/// arrived as environment-variable strings are parsed, so `SERVER_PORT=8080`
/// satisfies `get::<u16>("server.port")`.
pub trait FromValue: Sized {
    fn from_value(value: &ConfigValue, key: &str) -> Result<Self, ConfigError>;
}

fn mismatch(key: &str, expected: &'static str) -> ConfigError {
    ConfigError::TypeMismatch { key: key.to_string(), expected }
}

impl FromValue for String {
    fn from_value(value: &ConfigValue, key: &str) -> Result<Self, ConfigError> {
        match value {
            ConfigValue::Str(s) => Ok(s.clone()),
            ConfigValue::Int(i) => Ok(i.to_string()),
            ConfigValue::Float(f) => Ok(f.to_string()),
            ConfigValue::Bool(b) => Ok(b.to_string()),
            _ => Err(mismatch(key, "string")),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: &ConfigValue, key: &str) -> Result<Self, ConfigError> {
        match value {
            ConfigValue::Bool(b) => Ok(*b),
            ConfigValue::Str(s) => s.parse().map_err(|_| mismatch(key, "bool")),
            _ => Err(mismatch(key, "bool")),
        }
    }
}

impl FromValue for i64 {
    fn from_value(value: &ConfigValue, key: &str) -> Result<Self, ConfigError> {
        match value {
            ConfigValue::Int(i) => Ok(*i),
            ConfigValue::Str(s) => s.parse().map_err(|_| mismatch(key, "integer")),
            _ => Err(mismatch(key, "integer")),
        }
    }
}

impl FromValue for u16 {
    fn from_value(value: &ConfigValue, key: &str) -> Result<Self, ConfigError> {
        i64::from_value(value, key)?
            .try_into()
            .map_err(|_| mismatch(key, "u16"))
    }
}

impl FromValue for u64 {
    fn from_value(value: &ConfigValue, key: &str) -> Result<Self, ConfigError> {
        i64::from_value(value, key)?
            .try_into()
            .map_err(|_| mismatch(key, "u64"))
    }
}

impl FromValue for usize {
    fn from_value(value: &ConfigValue, key: &str) -> Result<Self, ConfigError> {
        i64::from_value(value, key)?
            .try_into()
            .map_err(|_| mismatch(key, "usize"))
    }
}

impl FromValue for f64 {
    fn from_value(value: &ConfigValue, key: &str) -> Result<Self, ConfigError> {
        match value {
            ConfigValue::Float(f) => Ok(*f),
            ConfigValue::Int(i) => Ok(*i as f64),
            ConfigValue::Str(s) => s.parse().map_err(|_| mismatch(key, "float")),
            _ => Err(mismatch(key, "float")),
        }
    }
}

impl FromValue for Vec<String> {
    fn from_value(value: &ConfigValue, key: &str) -> Result<Self, ConfigError> {
        match value {
            ConfigValue::List(items) => items
                .iter()
                .map(|item| String::from_value(item, key))
                .collect(),
            // A single scalar is accepted as a one-element list, so
            // `cors.allowed_origins: "*"` reads the same as a YAML list.
            single => Ok(vec![String::from_value(single, key)?]),
        }
    }
}

/// A strongly-typed projection of one configuration section.
pub trait ConfigProperties: Sized {
    /// The section's key prefix, e.g. `"server"`.
    fn prefix() -> &'static str;

    fn from_config(config: &PortwayConfig) -> Result<Self, ConfigError>;
}

/// Resolution backend for `${...}` placeholders in string values.
pub trait SecretResolver: Send + Sync {
    fn resolve(&self, reference: &str) -> Result<String, ConfigError>;
}

/// The default resolver: `${NAME}` and `${env:NAME}` read environment
/// variables; `${file:/path}` reads (and trims) a file.
pub struct EnvSecretResolver;

impl SecretResolver for EnvSecretResolver {
    fn resolve(&self, reference: &str) -> Result<String, ConfigError> {
        if let Some(path) = reference.strip_prefix("file:") {
            return std::fs::read_to_string(path.trim())
                .map(|s| s.trim().to_string())
                .map_err(|err| ConfigError::Load(format!("secret file '{}': {err}", path.trim())));
        }
        let name = reference.strip_prefix("env:").unwrap_or(reference).trim();
        std::env::var(name).map_err(|_| ConfigError::Missing(format!("${{{name}}}")))
    }
}

fn expand_placeholders(raw: &str, resolver: &dyn SecretResolver) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| ConfigError::Load(format!("unclosed placeholder in '{raw}'")))?;
        out.push_str(&resolver.resolve(&after[..end])?);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// The flattened, merged configuration for one process.
#[derive(Debug, Clone)]
pub struct PortwayConfig {
    entries: HashMap<String, ConfigValue>,
    profile: String,
}

impl PortwayConfig {
    /// Load configuration from the current working directory for `profile`,
    /// resolving secrets through [`EnvSecretResolver`].
    pub fn load(profile: &str) -> Result<Self, ConfigError> {
        Self::load_from(Path::new("."), profile, &EnvSecretResolver)
    }

    /// Load configuration rooted at `dir`. Layering order: base YAML,
    /// profile YAML, `.env` files, then process environment variables.
    pub fn load_from(
        dir: &Path,
        profile: &str,
        resolver: &dyn SecretResolver,
    ) -> Result<Self, ConfigError> {
        let profile = std::env::var("PORTWAY_PROFILE").unwrap_or_else(|_| profile.to_string());

        let mut entries = HashMap::new();
        merge_yaml_file(&dir.join("application.yaml"), &mut entries)?;
        merge_yaml_file(&dir.join(format!("application-{profile}.yaml")), &mut entries)?;

        // `.env` files populate the process environment without overwriting
        // variables that are already set.
        let _ = dotenvy::from_path(dir.join(".env"));
        let _ = dotenvy::from_path(dir.join(format!(".env.{profile}")));

        for (key, value) in entries.iter_mut() {
            let resolved = match value {
                ConfigValue::Str(s) if s.contains("${") => expand_placeholders(s, resolver)
                    .map_err(|err| ConfigError::Load(format!("while resolving '{key}': {err}")))?,
                _ => continue,
            };
            *value = ConfigValue::Str(resolved);
        }

        for (name, value) in std::env::vars() {
            entries.insert(name.to_lowercase().replace('_', "."), ConfigValue::Str(value));
        }

        Ok(PortwayConfig { entries, profile })
    }

    /// Build a config from a YAML string. Test seam; skips the env layers.
    pub fn from_yaml_str(yaml: &str, profile: &str) -> Result<Self, ConfigError> {
        let mut entries = HashMap::new();
        merge_yaml_str(yaml, &mut entries)?;
        Ok(PortwayConfig { entries, profile: profile.to_string() })
    }

    pub fn empty() -> Self {
        PortwayConfig { entries: HashMap::new(), profile: "test".to_string() }
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn set(&mut self, key: &str, value: ConfigValue) {
        self.entries.insert(key.to_string(), value);
    }

    /// Project one typed configuration section out of the merged map.
    pub fn section<C: ConfigProperties>(&self) -> Result<C, ConfigError> {
        let section = C::from_config(self)?;
        tracing::debug!(prefix = C::prefix(), profile = %self.profile, "config section loaded");
        Ok(section)
    }

    pub fn get<T: FromValue>(&self, key: &str) -> Result<T, ConfigError> {
        let value = self
            .entries
            .get(key)
            .ok_or_else(|| ConfigError::Missing(key.to_string()))?;
        T::from_value(value, key)
    }

    pub fn get_or<T: FromValue>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

fn merge_yaml_file(
    path: &Path,
    entries: &mut HashMap<String, ConfigValue>,
) -> Result<(), ConfigError> {
    if !path.exists() {
        return Ok(());
    }
    let content = std::fs::read_to_string(path).map_err(|err| ConfigError::Load(err.to_string()))?;
    merge_yaml_str(&content, entries)
}

fn merge_yaml_str(
    content: &str,
    entries: &mut HashMap<String, ConfigValue>,
) -> Result<(), ConfigError> {
    let root: serde_yaml::Value =
        serde_yaml::from_str(content).map_err(|err| ConfigError::Load(err.to_string()))?;
    flatten("", &root, entries);
    Ok(())
}

/// Flatten a YAML tree into dot-separated keys. Sequences are stored whole
/// under the parent key and as indexed `key.N` entries so environment
/// variables can override individual elements.
fn flatten(prefix: &str, value: &serde_yaml::Value, out: &mut HashMap<String, ConfigValue>) {
    match value {
        serde_yaml::Value::Mapping(map) => {
            for (k, v) in map {
                let name = match k {
                    serde_yaml::Value::String(s) => s.clone(),
                    other => format!("{other:?}"),
                };
                let key = if prefix.is_empty() { name } else { format!("{prefix}.{name}") };
                flatten(&key, v, out);
            }
        }
        serde_yaml::Value::Sequence(items) if !prefix.is_empty() => {
            out.insert(prefix.to_string(), ConfigValue::from_yaml(value));
            for (i, item) in items.iter().enumerate() {
                flatten(&format!("{prefix}.{i}"), item, out);
            }
        }
        _ if !prefix.is_empty() => {
            out.insert(prefix.to_string(), ConfigValue::from_yaml(value));
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_yaml_flattens_to_dot_keys() {
        let config = PortwayConfig::from_yaml_str(
            "server:\n  port: 8080\n  http2:\n    enabled: false\n",
            "test",
        )
        .unwrap();
        assert_eq!(config.get::<i64>("server.port").unwrap(), 8080);
        assert!(!config.get::<bool>("server.http2.enabled").unwrap());
    }

    #[test]
    fn sequences_flatten_whole_and_indexed() {
        let config = PortwayConfig::from_yaml_str(
            "cors:\n  allowed_origins:\n    - https://a.example\n    - https://b.example\n",
            "test",
        )
        .unwrap();
        let origins: Vec<String> = config.get("cors.allowed_origins").unwrap();
        assert_eq!(origins, vec!["https://a.example", "https://b.example"]);
        assert_eq!(
            config.get::<String>("cors.allowed_origins.1").unwrap(),
            "https://b.example"
        );
    }

    #[test]
    fn string_values_parse_into_numbers() {
        let mut config = PortwayConfig::empty();
        config.set("server.port", ConfigValue::Str("9090".to_string()));
        assert_eq!(config.get::<u16>("server.port").unwrap(), 9090);
    }

    #[test]
    fn missing_key_and_type_mismatch_are_distinct() {
        let config = PortwayConfig::from_yaml_str("server:\n  host: localhost\n", "test").unwrap();
        assert!(matches!(config.get::<i64>("server.nope"), Err(ConfigError::Missing(_))));
        assert!(matches!(
            config.get::<i64>("server.host"),
            Err(ConfigError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn get_or_falls_back_to_default() {
        let config = PortwayConfig::empty();
        assert_eq!(config.get_or::<u64>("server.shutdown_timeout_secs", 30), 30);
    }

    #[test]
    fn profile_overlay_wins_over_base() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("application.yaml"), "server:\n  port: 3000\n").unwrap();
        std::fs::write(dir.path().join("application-prod.yaml"), "server:\n  port: 443\n").unwrap();
        let config = PortwayConfig::load_from(dir.path(), "prod", &EnvSecretResolver).unwrap();
        assert_eq!(config.get::<u16>("server.port").unwrap(), 443);
    }

    #[test]
    fn placeholders_resolve_through_the_resolver() {
        struct Fixed;
        impl SecretResolver for Fixed {
            fn resolve(&self, reference: &str) -> Result<String, ConfigError> {
                Ok(format!("<{reference}>"))
            }
        }
        assert_eq!(
            expand_placeholders("a ${X} b ${Y}", &Fixed).unwrap(),
            "a <X> b <Y>"
        );
    }

    #[test]
    fn unclosed_placeholder_is_a_load_error() {
        assert!(matches!(
            expand_placeholders("${OOPS", &EnvSecretResolver),
            Err(ConfigError::Load(_))
        ));
    }

    #[test]
    fn file_secrets_read_and_trim() {
        let dir = tempfile::tempdir().unwrap();
        let secret = dir.path().join("token");
        std::fs::write(&secret, "s3cret\n").unwrap();
        let resolved = EnvSecretResolver
            .resolve(&format!("file:{}", secret.display()))
            .unwrap();
        assert_eq!(resolved, "s3cret");
    }
}
