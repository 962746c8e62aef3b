//! File path → route path translation.
//!
//! Maps a route module's filesystem location onto a canonical route path:
//! `routes/users/[id].rs` under base `routes` becomes `/users/:id` with a
//! single parameter named `id`. `index.rs` maps to its parent directory.

use crate::error::{ErrorKind, PortwayError};

/// Output of parsing a single route module's file path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRoute {
    /// The original file path, normalized to forward slashes.
    pub file_path: String,
    /// The canonical route path: begins with `/`, uses `:name` for dynamic
    /// segments.
    pub route_path: String,
    /// Parameter names in left-to-right order of appearance.
    pub params: Vec<String>,
}

/// Parse a route module's file path into a [`ParsedRoute`].
///
/// `base_dir` is the routes root; `file_path` is expected to live under it,
/// but if it is not a prefix the path is treated as already relative.
pub fn parse_route_path(file_path: &str, base_dir: &str) -> Result<ParsedRoute, PortwayError> {
    let normalized_file = normalize_separators(file_path);
    let normalized_base = normalize_separators(base_dir);

    let relative = strip_base(&normalized_file, &normalized_base);
    let without_ext = strip_extension(relative);

    let mut params = Vec::new();
    let mut segments = Vec::new();
    for raw_segment in without_ext.split('/').filter(|s| !s.is_empty()) {
        segments.push(rewrite_segment(raw_segment, &mut params)?);
    }

    let mut route_path = format!("/{}", segments.join("/"));
    if route_path == "/index" {
        route_path = "/".to_string();
    } else if let Some(stripped) = route_path.strip_suffix("/index") {
        route_path = stripped.to_string();
    }

    Ok(ParsedRoute {
        file_path: normalized_file,
        route_path,
        params,
    })
}

fn normalize_separators(path: &str) -> String {
    let without_scheme = path.strip_prefix("file://").unwrap_or(path);
    without_scheme.replace('\\', "/")
}

fn strip_base<'a>(file_path: &'a str, base_dir: &str) -> &'a str {
    if base_dir.is_empty() {
        return file_path.trim_start_matches('/');
    }
    let base = base_dir.trim_end_matches('/');
    if let Some(rest) = file_path.strip_prefix(base) {
        rest.trim_start_matches('/')
    } else {
        file_path.trim_start_matches('/')
    }
}

fn strip_extension(path: &str) -> &str {
    match path.rfind('.') {
        // Only strip if the dot is within the final segment (not a directory
        // name containing a dot further back).
        Some(idx) if !path[idx..].contains('/') => &path[..idx],
        _ => path,
    }
}

/// Rewrite a single path segment, recording a parameter name if bracketed.
fn rewrite_segment(segment: &str, params: &mut Vec<String>) -> Result<String, PortwayError> {
    if !segment.starts_with('[') {
        if segment.contains('[') || segment.contains(']') {
            return Err(bad_route_path(segment));
        }
        return Ok(segment.to_string());
    }

    if !segment.ends_with(']') {
        return Err(bad_route_path(segment));
    }

    let inner = &segment[1..segment.len() - 1];
    if inner.is_empty() || inner.contains('[') || inner.contains(']') {
        return Err(bad_route_path(segment));
    }

    params.push(inner.to_string());
    Ok(format!(":{inner}"))
}

fn bad_route_path(segment: &str) -> PortwayError {
    PortwayError::new(
        ErrorKind::BadRoutePath,
        format!("invalid route segment: '{segment}'"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_route() {
        let parsed = parse_route_path("routes/health.rs", "routes").unwrap();
        assert_eq!(parsed.route_path, "/health");
        assert!(parsed.params.is_empty());
    }

    #[test]
    fn index_maps_to_parent() {
        let parsed = parse_route_path("routes/users/index.rs", "routes").unwrap();
        assert_eq!(parsed.route_path, "/users");
    }

    #[test]
    fn root_index() {
        let parsed = parse_route_path("routes/index.rs", "routes").unwrap();
        assert_eq!(parsed.route_path, "/");
    }

    #[test]
    fn dynamic_segment() {
        let parsed = parse_route_path("routes/users/[id].rs", "routes").unwrap();
        assert_eq!(parsed.route_path, "/users/:id");
        assert_eq!(parsed.params, vec!["id".to_string()]);
    }

    #[test]
    fn multiple_dynamic_segments() {
        let parsed = parse_route_path("routes/orgs/[org]/users/[id].rs", "routes").unwrap();
        assert_eq!(parsed.route_path, "/orgs/:org/users/:id");
        assert_eq!(parsed.params, vec!["org".to_string(), "id".to_string()]);
    }

    #[test]
    fn windows_separators_and_file_scheme() {
        let parsed = parse_route_path(r"file://routes\users\[id].rs", "routes").unwrap();
        assert_eq!(parsed.route_path, "/users/:id");
    }

    #[test]
    fn empty_base_dir() {
        let parsed = parse_route_path("users/[id].rs", "").unwrap();
        assert_eq!(parsed.route_path, "/users/:id");
    }

    #[test]
    fn non_prefix_base_falls_back_to_relative() {
        let parsed = parse_route_path("other/users/[id].rs", "routes").unwrap();
        assert_eq!(parsed.route_path, "/other/users/:id");
    }

    #[test]
    fn nested_brackets_rejected() {
        let err = parse_route_path("routes/[a[b]].rs", "routes").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRoutePath);
    }

    #[test]
    fn unmatched_bracket_rejected() {
        let err = parse_route_path("routes/[id.rs", "routes").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRoutePath);
    }
}
