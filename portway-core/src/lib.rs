//! Core runtime of the portway application server: route discovery, the
//! hybrid trie matcher, the request pipeline, schema validation, the plugin
//! lifecycle manager, and the server lifecycle itself.
//!
//! A thin binary (the `portway-server` crate) is expected to load
//! [`config::PortwayConfig`], build a [`server::Server`] from it, register
//! route modules and plugins, and run the server to completion.

// Re-exported for the `register_route!` macro expansion and for route
// modules that name methods without adding their own `http` dependency.
pub use http;

pub mod body;
pub mod config;
pub mod context;
pub mod error;
pub mod loader;
pub mod logging;
pub mod matcher;
pub mod middleware;
pub mod path;
pub mod pipeline;
pub mod plugin;
pub mod registry;
pub mod route;
pub mod server;
pub mod validation;

pub use context::{Context, CorrelationId, ServiceRegistry};
pub use error::{ErrorKind, PortwayError};
pub use matcher::{MatchResult, Matcher};
pub use middleware::{Middleware, Next};
pub use path::ParsedRoute;
pub use plugin::{ErrorPolicy, LifecycleState, Phase, Plugin, PluginError, PluginHost, PluginManager};
pub use registry::RouteRegistry;
pub use route::{Route, RouteMethod, RouteSchema};
pub use server::{Server, ServerOptions, ServerShutdown, ServerState};
