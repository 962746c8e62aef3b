//! The route registry and filesystem watcher.
//!
//! Tracks which file produced which routes, rebuilds the matcher as new
//! files are loaded or changed, and (in development) watches the routes
//! directory for edits with a short debounce so editor save bursts
//! coalesce into one reload.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use http::Method;
use notify_debouncer_mini::{new_debouncer, DebounceEventResult};

use crate::loader::{self, LoadedRoute};
use crate::matcher::Matcher;
use crate::route::RouteMethod;

/// Two files producing the same `(path, method)` pair. Last-registered wins
/// on the matcher; this is surfaced separately so operators can fix it.
#[derive(Debug, Clone)]
pub struct RouteConflict {
    pub path: String,
    pub method: Method,
    pub winning_file: String,
    pub losing_file: String,
}

/// The outcome of a single reload: how many routes are now registered, how
/// long it took, and any conflicts it produced.
#[derive(Debug, Clone)]
pub struct ReloadReport {
    pub route_count: usize,
    pub duration: Duration,
    pub conflicts: Vec<RouteConflict>,
}

impl ReloadReport {
    pub fn is_slow(&self) -> bool {
        self.duration > Duration::from_millis(100)
    }
}

struct RegistryState {
    matcher: Matcher,
    /// file path -> the `(path, method)` keys it last contributed, so a
    /// reload of that file can be diffed against its own prior output.
    routes_by_file: HashMap<String, Vec<(String, Method)>>,
    conflicts: Vec<RouteConflict>,
}

impl RegistryState {
    fn new() -> Self {
        RegistryState {
            matcher: Matcher::new(),
            routes_by_file: HashMap::new(),
            conflicts: Vec::new(),
        }
    }
}

/// Owns the matcher and the file -> routes bookkeeping used to support hot
/// reload. Reads (route matches) never take the write lock; the matcher
/// itself is swapped wholesale on `load_all` and incrementally mutated on
/// `process_changed`, both under a single writer.
pub struct RouteRegistry {
    routes_dir: PathBuf,
    state: Arc<RwLock<RegistryState>>,
}

impl RouteRegistry {
    pub fn new(routes_dir: impl Into<PathBuf>) -> Self {
        RouteRegistry {
            routes_dir: routes_dir.into(),
            state: Arc::new(RwLock::new(RegistryState::new())),
        }
    }

    /// Enumerate every eligible route file under `routes_dir`, load them
    /// with bounded concurrency, and rebuild the matcher from scratch.
    pub async fn load_all(&self) -> Result<ReloadReport, crate::error::PortwayError> {
        let started = Instant::now();
        let files = loader::discover_route_files(&self.routes_dir)?;
        let concurrency = std::cmp::max(1, num_cpus() / 2);

        let mut loaded: Vec<(String, Vec<LoadedRoute>)> = Vec::with_capacity(files.len());
        for chunk in files.chunks(concurrency.max(1)) {
            let mut handles = Vec::new();
            for file in chunk {
                let file = file.clone();
                let base = self.routes_dir.clone();
                handles.push(tokio::spawn(async move {
                    let routes = loader::load_route_file(&file, &base);
                    (loader::relative_key(&file, &base), routes)
                }));
            }
            for handle in handles {
                if let Ok(pair) = handle.await {
                    loaded.push(pair);
                }
            }
        }

        let mut state = self.state.write().unwrap();
        *state = RegistryState::new();
        for (file, routes) in loaded {
            apply_file_routes(&mut state, &file, routes);
        }

        Ok(ReloadReport {
            route_count: state.matcher.list().len(),
            duration: started.elapsed(),
            conflicts: state.conflicts.clone(),
        })
    }

    /// Reload a single file: remove its previously-registered routes, load
    /// it fresh, and insert whatever it now produces. A file that no longer
    /// exists on disk (the watcher's `removed` event) contributes nothing,
    /// so its routes simply drop out.
    pub fn process_changed(&self, file: &Path) -> ReloadReport {
        let started = Instant::now();
        let file_key = loader::relative_key(file, &self.routes_dir);
        let routes = if file.exists() {
            loader::load_route_file(file, &self.routes_dir)
        } else {
            Vec::new()
        };

        let mut state = self.state.write().unwrap();
        if let Some(previous) = state.routes_by_file.remove(&file_key) {
            for (path, _method) in previous {
                state.matcher.remove(&path);
            }
        }
        state.conflicts.retain(|c| c.losing_file != file_key && c.winning_file != file_key);
        apply_file_routes(&mut state, &file_key, routes);

        ReloadReport {
            route_count: state.matcher.list().len(),
            duration: started.elapsed(),
            conflicts: state.conflicts.clone(),
        }
    }

    /// Register a single route directly, bypassing file discovery. This is
    /// the seam plugins use to add routes; directly-added routes take no
    /// part in file-based conflict tracking or hot reload.
    pub fn add_route(&self, path: &str, method: Method, route_method: RouteMethod) {
        let mut state = self.state.write().unwrap();
        state.matcher.add(path, method, route_method);
    }

    pub fn conflicts(&self) -> Vec<RouteConflict> {
        self.state.read().unwrap().conflicts.clone()
    }

    pub fn match_route(&self, path: &str, method: &Method) -> crate::matcher::MatchResult {
        self.state.read().unwrap().matcher.match_route(path, method)
    }

    pub fn route_count(&self) -> usize {
        self.state.read().unwrap().matcher.list().len()
    }

    /// Every registered route with its full method map, for introspection
    /// (route listings, admin endpoints).
    pub fn routes(&self) -> Vec<crate::route::Route> {
        self.state.read().unwrap().matcher.routes()
    }

    /// Watch `routes_dir` for filesystem changes, feeding each batch through
    /// `process_changed` after a ~50ms debounce so editor save bursts
    /// coalesce into one reload. Returns a handle whose drop (or explicit
    /// [`WatchHandle::stop`]) tears the watcher down.
    pub fn watch(self: &Arc<Self>) -> Result<WatchHandle, crate::error::PortwayError> {
        let registry = self.clone();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let mut debouncer = new_debouncer(Duration::from_millis(50), move |result: DebounceEventResult| {
            let _ = tx.send(result);
        })?;
        debouncer
            .watcher()
            .watch(&self.routes_dir, notify::RecursiveMode::Recursive)?;

        let task = tokio::spawn(async move {
            while let Some(result) = rx.recv().await {
                let Ok(events) = result else { continue };
                for event in events {
                    if loader::is_eligible_route_file(&event.path) {
                        let report = registry.process_changed(&event.path);
                        if report.is_slow() {
                            tracing::warn!(file = %event.path.display(), ms = report.duration.as_millis(), "slow route reload");
                        }
                        tracing::info!(count = report.route_count, file = %event.path.display(), "routes reloaded");
                    }
                }
            }
        });

        Ok(WatchHandle { _debouncer: debouncer, task })
    }
}

/// Insert `routes` (freshly loaded from `file`) into the matcher, recording
/// conflicts with whatever the matcher already has registered for the same
/// `(path, method)`.
fn apply_file_routes(state: &mut RegistryState, file: &str, routes: Vec<LoadedRoute>) {
    let mut keys = Vec::with_capacity(routes.len());
    for route in routes {
        let key = (route.path.clone(), route.method.clone());
        if let Some(existing_file) = find_owner(&state.routes_by_file, &key, file) {
            state.conflicts.push(RouteConflict {
                path: route.path.clone(),
                method: route.method.clone(),
                winning_file: file.to_string(),
                losing_file: existing_file,
            });
            tracing::warn!(path = %route.path, method = %route.method, winner = %file, "route conflict: last-registered wins");
        }
        state.matcher.add(&route.path, route.method.clone(), route.route_method);
        keys.push(key);
    }
    state.routes_by_file.insert(file.to_string(), keys);
}

fn find_owner(
    routes_by_file: &HashMap<String, Vec<(String, Method)>>,
    key: &(String, Method),
    excluding_file: &str,
) -> Option<String> {
    routes_by_file
        .iter()
        .find(|(f, keys)| f.as_str() != excluding_file && keys.contains(key))
        .map(|(f, _)| f.clone())
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// Owns the filesystem watcher and its background task. Dropping it (or
/// calling [`stop`](WatchHandle::stop)) stops observing changes.
pub struct WatchHandle {
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    task: tokio::task::JoinHandle<()>,
}

impl WatchHandle {
    pub fn stop(self) {
        self.task.abort();
    }
}
