//! The trie node type backing the route matcher.

use std::collections::{BTreeMap, HashMap};

use http::Method;

use crate::route::RouteMethod;

/// A single node in the route trie. Holds at most one param child and one
/// wildcard child (the data model's invariant), plus any number of exact
/// children keyed by segment text. Exact children are ordered so lookup
/// and `list()` traverse them deterministically.
#[derive(Default)]
pub struct RouteNode {
    pub(crate) exact_children: BTreeMap<String, RouteNode>,
    pub(crate) param_child: Option<(String, Box<RouteNode>)>,
    pub(crate) wildcard_child: Option<Box<RouteNode>>,
    pub(crate) methods: HashMap<Method, RouteMethod>,
}

impl RouteNode {
    pub fn new() -> Self {
        RouteNode::default()
    }

    /// Walk (creating as needed) the path to the node for `segments`,
    /// returning a mutable reference to the terminal node.
    pub fn insert_path<'a, I>(&'a mut self, mut segments: I) -> &'a mut RouteNode
    where
        I: Iterator<Item = &'a str>,
    {
        match segments.next() {
            None => self,
            Some(segment) if segment == "*" => {
                let child = self
                    .wildcard_child
                    .get_or_insert_with(|| Box::new(RouteNode::new()));
                child.insert_path(segments)
            }
            Some(segment) if segment.starts_with(':') => {
                let param_name = segment[1..].to_string();
                if self.param_child.is_none() {
                    self.param_child = Some((param_name, Box::new(RouteNode::new())));
                }
                let (_, child) = self.param_child.as_mut().unwrap();
                child.insert_path(segments)
            }
            Some(segment) => {
                let child = self
                    .exact_children
                    .entry(segment.to_string())
                    .or_insert_with(RouteNode::new);
                child.insert_path(segments)
            }
        }
    }

    /// Remove whatever route methods are attached at the terminal node for
    /// `segments`, pruning now-empty branches along the way. Returns `true`
    /// if anything was removed.
    pub fn remove_path<'a, I>(&mut self, mut segments: I) -> bool
    where
        I: Iterator<Item = &'a str>,
    {
        match segments.next() {
            None => {
                let had_methods = !self.methods.is_empty();
                self.methods.clear();
                had_methods
            }
            Some(segment) if segment == "*" => self
                .wildcard_child
                .as_mut()
                .map(|child| child.remove_path(segments))
                .unwrap_or(false),
            Some(segment) if segment.starts_with(':') => self
                .param_child
                .as_mut()
                .map(|(_, child)| child.remove_path(segments))
                .unwrap_or(false),
            Some(segment) => self
                .exact_children
                .get_mut(segment)
                .map(|child| child.remove_path(segments))
                .unwrap_or(false),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
            && self.exact_children.is_empty()
            && self.param_child.is_none()
            && self.wildcard_child.is_none()
    }

    /// Collect every `(path, method)` registered under this subtree,
    /// prefixed by `prefix`.
    pub fn collect(&self, prefix: &str, out: &mut Vec<(String, Method)>) {
        let path = if prefix.is_empty() { "/".to_string() } else { prefix.to_string() };
        for method in self.methods.keys() {
            out.push((path.clone(), method.clone()));
        }
        for (segment, child) in &self.exact_children {
            child.collect(&format!("{prefix}/{segment}"), out);
        }
        if let Some((name, child)) = &self.param_child {
            child.collect(&format!("{prefix}/:{name}"), out);
        }
        if let Some(child) = &self.wildcard_child {
            child.collect(&format!("{prefix}/*"), out);
        }
    }

    /// Collect every terminal under this subtree as a full [`Route`]
    /// record, one per path with its whole method map.
    pub fn collect_routes(&self, prefix: &str, out: &mut Vec<crate::route::Route>) {
        if !self.methods.is_empty() {
            let path = if prefix.is_empty() { "/".to_string() } else { prefix.to_string() };
            let mut route = crate::route::Route::new(path);
            for (method, route_method) in &self.methods {
                route.insert(method.clone(), route_method.clone());
            }
            out.push(route);
        }
        for (segment, child) in &self.exact_children {
            child.collect_routes(&format!("{prefix}/{segment}"), out);
        }
        if let Some((name, child)) = &self.param_child {
            child.collect_routes(&format!("{prefix}/:{name}"), out);
        }
        if let Some(child) = &self.wildcard_child {
            child.collect_routes(&format!("{prefix}/*"), out);
        }
    }
}
