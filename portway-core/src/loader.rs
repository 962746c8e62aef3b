//! The route loader.
//!
//! Route files are not imported dynamically — the target has no runtime
//! module loader. Instead every route file registers its handlers at
//! process start via the [`register_route`] macro, which inserts into a
//! static table keyed by the file's logical path. Loading a file, here,
//! means looking that table up and invoking the stored handler factories;
//! hot reload re-invokes the factory every time rather than caching its
//! result, so edits to a handler's captured state are observed on the next
//! request after a reload.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use http::Method;

use crate::error::PortwayError;
use crate::path::parse_route_path;
use crate::route::RouteMethod;

/// One method's handler factory, registered by a route file under its
/// logical path **relative to the routes root** (`health.rs`,
/// `users/[id].rs`). `export_name` distinguishes the file's default export
/// from any named exports, purely for diagnostics — precedence between them
/// is last-registered-wins, matching the rest of the table.
#[derive(Clone)]
pub struct RouteModuleEntry {
    pub file_path: &'static str,
    pub export_name: &'static str,
    pub method: Method,
    pub factory: fn() -> RouteMethod,
}

static ROUTE_MODULE_REGISTRY: Mutex<Vec<RouteModuleEntry>> = Mutex::new(Vec::new());

/// Register one route file's handler factory. Called by [`register_route`];
/// not normally invoked directly.
pub fn submit(entry: RouteModuleEntry) {
    ROUTE_MODULE_REGISTRY.lock().unwrap().push(entry);
}

/// Register a handler for `(file, method)` from within a route module's own
/// registration function. The file path is relative to the routes root.
///
/// ```ignore
/// pub fn register() {
///     portway_core::register_route!("health.rs", GET, || {
///         RouteMethod::new(|_ctx| async move { Ok(serde_json::json!({"ok": true})) })
///     });
/// }
/// ```
#[macro_export]
macro_rules! register_route {
    ($file:literal, $method:ident, $factory:expr) => {
        $crate::loader::submit($crate::loader::RouteModuleEntry {
            file_path: $file,
            export_name: "default",
            method: $crate::http::Method::$method,
            factory: $factory,
        })
    };
    ($file:literal, $method:ident, $export:literal, $factory:expr) => {
        $crate::loader::submit($crate::loader::RouteModuleEntry {
            file_path: $file,
            export_name: $export,
            method: $crate::http::Method::$method,
            factory: $factory,
        })
    };
}

/// A single route produced by loading one file.
pub struct LoadedRoute {
    pub path: String,
    pub method: Method,
    pub route_method: RouteMethod,
}

/// Load every route a single file contributes. On any lookup or parse
/// failure this logs and returns an empty list — the registry does not
/// abort the server over one bad file.
pub fn load_route_file(file_path: &Path, base_dir: &Path) -> Vec<LoadedRoute> {
    let file_key = relative_key(file_path, base_dir);

    let parsed = match parse_route_path(&file_key, "") {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::warn!(file = %file_key, error = %err, "route file path could not be parsed");
            return Vec::new();
        }
    };

    let registry = ROUTE_MODULE_REGISTRY.lock().unwrap();
    let mut by_method: std::collections::HashMap<Method, &RouteModuleEntry> = std::collections::HashMap::new();
    for entry in registry.iter() {
        if entry.file_path == file_key {
            // Last-registered wins when default and named exports collide
            // on the same method.
            by_method.insert(entry.method.clone(), entry);
        }
    }

    if by_method.is_empty() {
        tracing::warn!(file = %file_key, "no registered route handlers found for file");
        return Vec::new();
    }

    by_method
        .into_values()
        .map(|entry| LoadedRoute {
            path: parsed.route_path.clone(),
            method: entry.method.clone(),
            route_method: (entry.factory)(),
        })
        .collect()
}

/// Compute the registry key for a discovered file: its path relative to
/// the routes root, forward-slashed. The watcher reports absolute paths
/// while the configured root may be relative, so both spellings are tried
/// before giving up and using the path as-is.
pub fn relative_key(file_path: &Path, base_dir: &Path) -> String {
    if let Ok(rel) = file_path.strip_prefix(base_dir) {
        return slashed(rel);
    }
    if let Ok(canonical_base) = std::fs::canonicalize(base_dir) {
        if let Ok(rel) = file_path.strip_prefix(&canonical_base) {
            return slashed(rel);
        }
        if let Ok(canonical_file) = std::fs::canonicalize(file_path) {
            if let Ok(rel) = canonical_file.strip_prefix(&canonical_base) {
                return slashed(rel);
            }
        }
    }
    slashed(file_path)
}

fn slashed(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Recursively enumerate every `.rs` file under `routes_dir` eligible for
/// route loading, excluding leading-underscore, test/spec, and declaration
/// files.
pub fn discover_route_files(routes_dir: &Path) -> Result<Vec<PathBuf>, PortwayError> {
    let mut out = Vec::new();
    if !routes_dir.exists() {
        return Ok(out);
    }
    walk(routes_dir, &mut out)?;
    Ok(out)
}

fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), PortwayError> {
    let entries = std::fs::read_dir(dir)?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk(&path, out)?;
        } else if is_eligible_route_file(&path) {
            out.push(path);
        }
    }
    Ok(())
}

/// Whether `path` should be treated as a route file at all — by the loader's
/// directory walk, and by the watcher when deciding whether a filesystem
/// event is worth a reload.
pub fn is_eligible_route_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else { return false };
    if path.extension().and_then(|e| e.to_str()) != Some("rs") {
        return false;
    }
    if name.starts_with('_') {
        return false;
    }
    let stem = name.trim_end_matches(".rs");
    if stem.ends_with("_test") || stem.ends_with(".test") || stem.ends_with(".spec") || stem.ends_with(".d") {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler_factory() -> RouteMethod {
        RouteMethod::new(|_ctx| async move { Ok(serde_json::json!({"ok": true})) })
    }

    #[test]
    fn eligible_file_filters_exclude_helpers_and_tests() {
        assert!(is_eligible_route_file(Path::new("routes/health.rs")));
        assert!(!is_eligible_route_file(Path::new("routes/_helpers.rs")));
        assert!(!is_eligible_route_file(Path::new("routes/health_test.rs")));
        assert!(!is_eligible_route_file(Path::new("routes/health.spec.rs")));
        assert!(!is_eligible_route_file(Path::new("routes/health.d.rs")));
        assert!(!is_eligible_route_file(Path::new("routes/notes.txt")));
    }

    #[test]
    fn discover_route_files_walks_recursively_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("users")).unwrap();
        std::fs::write(dir.path().join("health.rs"), "").unwrap();
        std::fs::write(dir.path().join("users/[id].rs"), "").unwrap();
        std::fs::write(dir.path().join("_helpers.rs"), "").unwrap();
        std::fs::write(dir.path().join("health_test.rs"), "").unwrap();

        let mut files = discover_route_files(dir.path())
            .unwrap()
            .into_iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect::<Vec<_>>();
        files.sort();
        assert_eq!(files, vec!["[id].rs".to_string(), "health.rs".to_string()]);
    }

    #[test]
    fn relative_key_strips_the_routes_root() {
        assert_eq!(
            relative_key(Path::new("routes/users/[id].rs"), Path::new("routes")),
            "users/[id].rs"
        );
    }

    #[test]
    fn relative_key_resolves_absolute_paths_against_a_relative_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("health.rs"), "").unwrap();
        let key = relative_key(&dir.path().join("health.rs"), dir.path());
        assert_eq!(key, "health.rs");
    }

    #[test]
    fn load_route_file_returns_empty_for_unregistered_file() {
        let routes = load_route_file(Path::new("routes/never-registered.rs"), Path::new("routes"));
        assert!(routes.is_empty());
    }

    #[test]
    fn load_route_file_resolves_registered_handlers() {
        submit(RouteModuleEntry {
            file_path: "loader-test-health.rs",
            export_name: "default",
            method: Method::GET,
            factory: handler_factory,
        });
        let routes = load_route_file(Path::new("routes/loader-test-health.rs"), Path::new("routes"));
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].path, "/loader-test-health");
        assert_eq!(routes[0].method, Method::GET);
    }

    #[test]
    fn later_registration_for_same_method_wins() {
        fn first() -> RouteMethod {
            RouteMethod::new(|_ctx| async move { Ok(serde_json::json!({"which": "first"})) })
        }
        fn second() -> RouteMethod {
            RouteMethod::new(|_ctx| async move { Ok(serde_json::json!({"which": "second"})) })
        }
        submit(RouteModuleEntry {
            file_path: "loader-test-conflict.rs",
            export_name: "default",
            method: Method::GET,
            factory: first,
        });
        submit(RouteModuleEntry {
            file_path: "loader-test-conflict.rs",
            export_name: "named",
            method: Method::GET,
            factory: second,
        });
        let routes = load_route_file(Path::new("routes/loader-test-conflict.rs"), Path::new("routes"));
        assert_eq!(routes.len(), 1);
    }
}
