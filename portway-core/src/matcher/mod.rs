//! The route matcher: a hybrid radix tree for static,
//! parameterized, and wildcard routes.
//!
//! Precedence at lookup is exact > param > wildcard. The first exact match
//! that yields a handler for the requested method wins; param and wildcard
//! subtrees are tried, in that order, only when no exact subtree matches.
//! No regex sits on the hot path.

mod node;

use std::collections::HashMap;

use http::Method;

use node::RouteNode;

use crate::route::RouteMethod;

/// The result of resolving `(method, path)` against the matcher.
pub enum MatchResult {
    Found {
        route_method: RouteMethod,
        params: HashMap<String, String>,
    },
    MethodNotAllowed {
        allowed: Vec<Method>,
    },
    NotFound,
}

/// A hybrid trie matcher. `add`/`remove` mutate the tree directly; the
/// matcher itself is not synchronized. [`crate::registry::RouteRegistry`]
/// wraps it in a single-writer lock so reloads never block concurrent
/// matches on the write path longer than the swap itself.
#[derive(Default)]
pub struct Matcher {
    root: RouteNode,
}

impl Matcher {
    pub fn new() -> Self {
        Matcher::default()
    }

    /// Register `route_method` at `(path, method)`. `path` must already be
    /// in canonical form (the output of [`crate::path::parse_route_path`]):
    /// segments are `:name` for params, `*` for a trailing wildcard.
    pub fn add(&mut self, path: &str, method: Method, route_method: RouteMethod) {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let node = self.root.insert_path(segments.into_iter());
        node.methods.insert(method, route_method);
    }

    pub fn remove(&mut self, path: &str) -> bool {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        self.root.remove_path(segments.into_iter())
    }

    pub fn clear(&mut self) {
        self.root = RouteNode::new();
    }

    pub fn list(&self) -> Vec<(String, Method)> {
        let mut out = Vec::new();
        self.root.collect("", &mut out);
        out
    }

    /// Every registered route as a full [`crate::route::Route`] record,
    /// one per path with its complete method map.
    pub fn routes(&self) -> Vec<crate::route::Route> {
        let mut out = Vec::new();
        self.root.collect_routes("", &mut out);
        out
    }

    /// Resolve `(method, path)`.
    pub fn match_route(&self, path: &str, method: &Method) -> MatchResult {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut params = HashMap::new();
        match resolve(&self.root, &segments, method, &mut params) {
            Resolved::Found(route_method) => MatchResult::Found { route_method, params },
            Resolved::WrongMethod(allowed) => MatchResult::MethodNotAllowed { allowed },
            Resolved::Nothing => MatchResult::NotFound,
        }
    }
}

enum Resolved {
    Found(RouteMethod),
    WrongMethod(Vec<Method>),
    Nothing,
}

/// Walk the trie, exact-first, then param, then wildcard, backtracking the
/// tentative param binding when a deeper subtree fails to match. Collects
/// allowed methods from terminal nodes the path resolves to even when the
/// requested method isn't among them, for the 405 response.
fn resolve(
    node: &RouteNode,
    segments: &[&str],
    method: &Method,
    params: &mut HashMap<String, String>,
) -> Resolved {
    if segments.is_empty() {
        if let Some(route_method) = node.methods.get(method) {
            return Resolved::Found(route_method.clone());
        }
        if !node.methods.is_empty() {
            return Resolved::WrongMethod(node.methods.keys().cloned().collect());
        }
        return Resolved::Nothing;
    }

    let (head, rest) = (segments[0], &segments[1..]);
    let mut best_allowed: Option<Vec<Method>> = None;

    if let Some(child) = node.exact_children.get(head) {
        match resolve(child, rest, method, params) {
            found @ Resolved::Found(_) => return found,
            Resolved::WrongMethod(allowed) => best_allowed = Some(allowed),
            Resolved::Nothing => {}
        }
    }

    if let Some((name, child)) = &node.param_child {
        let previous = params.insert(name.clone(), head.to_string());
        match resolve(child, rest, method, params) {
            found @ Resolved::Found(_) => return found,
            Resolved::WrongMethod(allowed) => {
                if best_allowed.is_none() {
                    best_allowed = Some(allowed);
                }
                restore(params, name, previous);
            }
            Resolved::Nothing => {
                restore(params, name, previous);
            }
        }
    }

    if let Some(child) = &node.wildcard_child {
        let tail = segments.join("/");
        let previous = params.insert("*".to_string(), tail);
        match resolve(child, &[], method, params) {
            found @ Resolved::Found(_) => return found,
            Resolved::WrongMethod(allowed) => {
                if best_allowed.is_none() {
                    best_allowed = Some(allowed);
                }
                restore(params, "*", previous);
            }
            Resolved::Nothing => {
                restore(params, "*", previous);
            }
        }
    }

    match best_allowed {
        Some(allowed) => Resolved::WrongMethod(allowed),
        None => Resolved::Nothing,
    }
}

fn restore(params: &mut HashMap<String, String>, key: &str, previous: Option<String>) {
    match previous {
        Some(value) => {
            params.insert(key.to_string(), value);
        }
        None => {
            params.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::RouteMethod;

    fn handler() -> RouteMethod {
        RouteMethod::new(|_ctx| async move { Ok(serde_json::json!({"ok": true})) })
    }

    #[test]
    fn exact_route_matches() {
        let mut matcher = Matcher::new();
        matcher.add("/users", Method::GET, handler());
        match matcher.match_route("/users", &Method::GET) {
            MatchResult::Found { params, .. } => assert!(params.is_empty()),
            _ => panic!("expected match"),
        }
    }

    #[test]
    fn not_found_for_unknown_path() {
        let matcher = Matcher::new();
        assert!(matches!(matcher.match_route("/nope", &Method::GET), MatchResult::NotFound));
    }

    #[test]
    fn method_not_allowed_lists_siblings() {
        let mut matcher = Matcher::new();
        matcher.add("/users", Method::GET, handler());
        match matcher.match_route("/users", &Method::POST) {
            MatchResult::MethodNotAllowed { allowed } => assert_eq!(allowed, vec![Method::GET]),
            _ => panic!("expected method not allowed"),
        }
    }

    #[test]
    fn param_route_extracts_value() {
        let mut matcher = Matcher::new();
        matcher.add("/users/:id", Method::GET, handler());
        match matcher.match_route("/users/42", &Method::GET) {
            MatchResult::Found { params, .. } => assert_eq!(params.get("id"), Some(&"42".to_string())),
            _ => panic!("expected match"),
        }
    }

    #[test]
    fn exact_beats_param_at_same_depth() {
        let mut matcher = Matcher::new();
        matcher.add("/users/admin", Method::GET, handler());
        matcher.add("/users/:id", Method::GET, handler());
        match matcher.match_route("/users/admin", &Method::GET) {
            MatchResult::Found { params, .. } => assert!(params.is_empty()),
            _ => panic!("expected exact match for /users/admin"),
        }
        match matcher.match_route("/users/123", &Method::GET) {
            MatchResult::Found { params, .. } => assert_eq!(params.get("id"), Some(&"123".to_string())),
            _ => panic!("expected param match for /users/123"),
        }
    }

    #[test]
    fn wildcard_consumes_remaining_segments() {
        let mut matcher = Matcher::new();
        matcher.add("/users/admin", Method::GET, handler());
        matcher.add("/users/:id", Method::GET, handler());
        matcher.add("/users/*", Method::GET, handler());
        match matcher.match_route("/users/123/extra", &Method::GET) {
            MatchResult::Found { params, .. } => {
                assert_eq!(params.get("*"), Some(&"123/extra".to_string()))
            }
            _ => panic!("expected wildcard match"),
        }
    }

    #[test]
    fn backtracks_from_param_to_wildcard_on_method_mismatch() {
        let mut matcher = Matcher::new();
        matcher.add("/a/:id", Method::POST, handler());
        matcher.add("/a/*", Method::GET, handler());
        match matcher.match_route("/a/1", &Method::GET) {
            MatchResult::Found { params, .. } => assert_eq!(params.get("*"), Some(&"1".to_string())),
            _ => panic!("expected wildcard fallback, got a different result"),
        }
    }

    #[test]
    fn remove_clears_terminal_methods() {
        let mut matcher = Matcher::new();
        matcher.add("/users", Method::GET, handler());
        assert!(matcher.remove("/users"));
        assert!(matches!(matcher.match_route("/users", &Method::GET), MatchResult::NotFound));
    }

    #[test]
    fn list_reports_all_registered_routes() {
        let mut matcher = Matcher::new();
        matcher.add("/users", Method::GET, handler());
        matcher.add("/users/:id", Method::GET, handler());
        let listed = matcher.list();
        assert_eq!(listed.len(), 2);
    }

    #[test]
    fn routes_group_methods_per_path() {
        let mut matcher = Matcher::new();
        matcher.add("/users", Method::GET, handler());
        matcher.add("/users", Method::POST, handler());
        matcher.add("/users/:id", Method::GET, handler());
        let routes = matcher.routes();
        assert_eq!(routes.len(), 2);
        let users = routes.iter().find(|r| r.path == "/users").unwrap();
        assert_eq!(users.allowed_methods(), "GET, POST");
    }

    #[test]
    fn clear_empties_the_whole_table() {
        let mut matcher = Matcher::new();
        matcher.add("/users", Method::GET, handler());
        matcher.clear();
        assert!(matcher.list().is_empty());
        assert!(matches!(matcher.match_route("/users", &Method::GET), MatchResult::NotFound));
    }
}
