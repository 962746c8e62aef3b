//! The plugin lifecycle manager.
//!
//! A [`Plugin`] is a lifecycle-bound extension: it may install services,
//! add routes, and own external resources across five ordered phases.
//! [`PluginManager`] drives those phases deterministically and applies the
//! configured [`ErrorPolicy`] when a hook fails.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::ServiceRegistry;
use crate::error::PortwayError;
use crate::registry::RouteRegistry;

/// Plugin names that would shadow the server's own surface.
const RESERVED_NAMES: &[&str] = &["portway", "server", "core", "router", "pipeline"];

/// The slice of server API a plugin is allowed to touch: install services,
/// add routes. Plugins hold this handle only for the duration of a hook
/// call; the context references services but never the server itself.
pub struct PluginHost {
    pub services: Arc<ServiceRegistry>,
    pub registry: Arc<RouteRegistry>,
}

/// Boxed future returned by every lifecycle hook.
pub type HookFuture<'a> = Pin<Box<dyn Future<Output = Result<(), PluginError>> + Send + 'a>>;

/// An error raised by a plugin hook, carrying the plugin's name for
/// diagnostics.
#[derive(Debug, Clone)]
pub struct PluginError {
    pub plugin: String,
    pub phase: Phase,
    pub message: String,
}

impl PluginError {
    /// Shorthand for failing a hook; the manager fills in name and phase.
    pub fn message(message: impl Into<String>) -> Self {
        PluginError {
            plugin: String::new(),
            phase: Phase::Register,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for PluginError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "plugin '{}' failed during {:?}: {}", self.plugin, self.phase, self.message)
    }
}

impl std::error::Error for PluginError {}

impl From<PluginError> for PortwayError {
    fn from(err: PluginError) -> Self {
        PortwayError::internal(err.to_string())
    }
}

/// One of the five ordered phases a plugin passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Register,
    Initialize,
    OnServerStart,
    OnServerStop,
    Terminate,
}

/// A lifecycle-bound server extension. Every hook has a no-op default so a
/// plugin only needs to implement the phases it cares about.
///
/// `terminate` must release anything acquired in `register` or
/// `initialize` — typically by calling [`ServiceRegistry::remove`] for each
/// installed service.
pub trait Plugin: Send + Sync + 'static {
    /// Must match `^[a-z][a-z0-9-]*$` and avoid the reserved set; checked
    /// once, before the `register` phase runs.
    fn name(&self) -> &str;

    /// Semver, e.g. `"1.4.0"` or `"0.2.0-rc.1"`.
    fn version(&self) -> &str {
        "0.1.0"
    }

    fn register<'a>(&'a self, _host: &'a PluginHost) -> HookFuture<'a> {
        Box::pin(async { Ok(()) })
    }

    fn initialize<'a>(&'a self, _host: &'a PluginHost) -> HookFuture<'a> {
        Box::pin(async { Ok(()) })
    }

    fn on_server_start<'a>(&'a self, _host: &'a PluginHost) -> HookFuture<'a> {
        Box::pin(async { Ok(()) })
    }

    fn on_server_stop<'a>(&'a self, _host: &'a PluginHost) -> HookFuture<'a> {
        Box::pin(async { Ok(()) })
    }

    fn terminate<'a>(&'a self, _host: &'a PluginHost) -> HookFuture<'a> {
        Box::pin(async { Ok(()) })
    }
}

/// Whether a phase failure aborts the transition or is logged and skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Log the failure and continue with the remaining plugins in this phase.
    ContinueOnError,
    /// Abort the phase transition immediately on the first failure.
    AbortOnError,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        ErrorPolicy::ContinueOnError
    }
}

/// The lifecycle manager's own state, mirroring the state machine:
/// `Created -> Registered -> Initialized -> Running -> Stopping -> Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Registered,
    Initialized,
    Running,
    Stopping,
    Terminated,
}

/// Drives a fixed set of plugins through their lifecycle in registration
/// order (forward phases) or reverse (teardown phases), applying the
/// configured error policy and collecting every failure encountered along
/// the way so a caller can decide how to report them.
pub struct PluginManager {
    plugins: Vec<Arc<dyn Plugin>>,
    policy: ErrorPolicy,
    host: PluginHost,
    state: LifecycleState,
}

impl PluginManager {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>, policy: ErrorPolicy, host: PluginHost) -> Self {
        PluginManager { plugins, policy, host, state: LifecycleState::Created }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Check every plugin's name and version before any hook runs. A
    /// failure here is a fatal startup error regardless of the configured
    /// error policy.
    pub fn validate(&self) -> Result<(), PortwayError> {
        let mut seen = std::collections::HashSet::new();
        for plugin in &self.plugins {
            let name = plugin.name();
            if !is_valid_plugin_name(name) {
                return Err(PortwayError::internal(format!(
                    "invalid plugin name '{name}': must match ^[a-z][a-z0-9-]*$"
                )));
            }
            if RESERVED_NAMES.contains(&name) {
                return Err(PortwayError::internal(format!("plugin name '{name}' is reserved")));
            }
            if !seen.insert(name.to_string()) {
                return Err(PortwayError::internal(format!("duplicate plugin name '{name}'")));
            }
            let version = plugin.version();
            if !is_valid_semver(version) {
                return Err(PortwayError::internal(format!(
                    "plugin '{name}' has invalid version '{version}': expected semver"
                )));
            }
        }
        Ok(())
    }

    /// Run `register` for every plugin, forward order.
    pub async fn register(&mut self) -> Result<Vec<PluginError>, PluginError> {
        let errors = self.run_phase(Phase::Register, Direction::Forward).await?;
        self.state = LifecycleState::Registered;
        Ok(errors)
    }

    /// Run `initialize` for every plugin, forward order.
    pub async fn initialize(&mut self) -> Result<Vec<PluginError>, PluginError> {
        let errors = self.run_phase(Phase::Initialize, Direction::Forward).await?;
        self.state = LifecycleState::Initialized;
        Ok(errors)
    }

    /// Run `on_server_start` for every plugin, forward order.
    pub async fn on_server_start(&mut self) -> Result<Vec<PluginError>, PluginError> {
        let errors = self.run_phase(Phase::OnServerStart, Direction::Forward).await?;
        self.state = LifecycleState::Running;
        Ok(errors)
    }

    /// Run `on_server_stop` for every plugin, reverse order.
    pub async fn on_server_stop(&mut self) -> Result<Vec<PluginError>, PluginError> {
        let errors = self.run_phase(Phase::OnServerStop, Direction::Reverse).await?;
        self.state = LifecycleState::Stopping;
        Ok(errors)
    }

    /// Run `terminate` for every plugin, reverse order.
    pub async fn terminate(&mut self) -> Result<Vec<PluginError>, PluginError> {
        let errors = self.run_phase(Phase::Terminate, Direction::Reverse).await?;
        self.state = LifecycleState::Terminated;
        Ok(errors)
    }

    async fn run_phase(
        &self,
        phase: Phase,
        direction: Direction,
    ) -> Result<Vec<PluginError>, PluginError> {
        let mut errors = Vec::new();
        let order: Box<dyn Iterator<Item = &Arc<dyn Plugin>> + Send> = match direction {
            Direction::Forward => Box::new(self.plugins.iter()),
            Direction::Reverse => Box::new(self.plugins.iter().rev()),
        };

        for plugin in order {
            let outcome = match phase {
                Phase::Register => plugin.register(&self.host).await,
                Phase::Initialize => plugin.initialize(&self.host).await,
                Phase::OnServerStart => plugin.on_server_start(&self.host).await,
                Phase::OnServerStop => plugin.on_server_stop(&self.host).await,
                Phase::Terminate => plugin.terminate(&self.host).await,
            };

            if let Err(mut err) = outcome {
                err.plugin = plugin.name().to_string();
                err.phase = phase;
                tracing::error!(plugin = %err.plugin, phase = ?phase, error = %err.message, "plugin lifecycle hook failed");
                match self.policy {
                    ErrorPolicy::ContinueOnError => errors.push(err),
                    ErrorPolicy::AbortOnError => return Err(err),
                }
            }
        }

        Ok(errors)
    }
}

enum Direction {
    Forward,
    Reverse,
}

fn is_valid_plugin_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// `major.minor.patch` with an optional `-prerelease` / `+build` tail.
fn is_valid_semver(version: &str) -> bool {
    let core = version
        .split_once(['-', '+'])
        .map(|(core, _)| core)
        .unwrap_or(version);
    let mut parts = core.split('.');
    let numeric = |part: Option<&str>| {
        part.is_some_and(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
    };
    numeric(parts.next()) && numeric(parts.next()) && numeric(parts.next()) && parts.next().is_none()
}
