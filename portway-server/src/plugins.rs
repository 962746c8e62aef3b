//! Plugins shipped with the server binary.

use portway_core::plugin::{HookFuture, Plugin, PluginHost};

/// Build-time facts about this binary, installed as a service so any route
/// can report them (see the health route).
pub struct AppInfo {
    pub name: &'static str,
    pub version: &'static str,
}

/// Installs [`AppInfo`] into the service registry on `register` and
/// releases it on `terminate`.
#[derive(Default)]
pub struct AppInfoPlugin;

impl Plugin for AppInfoPlugin {
    fn name(&self) -> &str {
        "app-info"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn register<'a>(&'a self, host: &'a PluginHost) -> HookFuture<'a> {
        Box::pin(async move {
            host.services.install(AppInfo {
                name: env!("CARGO_PKG_NAME"),
                version: env!("CARGO_PKG_VERSION"),
            });
            Ok(())
        })
    }

    fn terminate<'a>(&'a self, host: &'a PluginHost) -> HookFuture<'a> {
        Box::pin(async move {
            host.services.remove::<AppInfo>();
            Ok(())
        })
    }
}
