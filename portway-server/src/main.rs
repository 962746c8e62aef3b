//! Thin process entry point: parse the command line, load configuration,
//! register the compiled route modules, build a [`portway_core::Server`],
//! and run it to completion.

mod plugins;
mod routes;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use portway_core::config::PortwayConfig;
use portway_core::plugin::{ErrorPolicy, Plugin};
use portway_core::server::{RuntimeEnv, Server, ServerOptions};
use portway_core::ErrorKind;

#[derive(Debug, Parser)]
#[command(name = "portway", about = "File-driven HTTP/2 application server")]
struct Cli {
    /// Configuration profile; `PORTWAY_PROFILE` wins when both are set.
    #[arg(long)]
    profile: Option<String>,
    /// Override the configured listener port.
    #[arg(long)]
    port: Option<u16>,
    /// Override the configured bind address.
    #[arg(long)]
    host: Option<String>,
    /// Override the configured routes directory.
    #[arg(long)]
    routes_dir: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let env = RuntimeEnv::from_env();

    let profile = cli.profile.clone().unwrap_or_else(|| {
        match env {
            RuntimeEnv::Production => "production",
            RuntimeEnv::Test => "test",
            RuntimeEnv::Development => "development",
        }
        .to_string()
    });

    let (options, policy) = match load_configuration(&profile, &cli) {
        Ok(loaded) => loaded,
        Err(err) => {
            // Logging isn't up yet; this is the one place stderr is it.
            eprintln!("failed to load server configuration: {err}");
            return ExitCode::from(1);
        }
    };

    portway_core::logging::init(options.env, options.logging.level.as_deref());
    routes::register_all();

    let plugin_list: Vec<Arc<dyn Plugin>> = vec![Arc::new(plugins::AppInfoPlugin::default())];

    let server = match Server::new(options, Vec::new(), plugin_list, policy) {
        Ok(server) => server,
        Err(err) => {
            tracing::error!(error = %err, "invalid server configuration");
            return ExitCode::from(1);
        }
    };

    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) if err.kind() == ErrorKind::ShutdownTimeout => {
            tracing::error!(error = %err, "shutdown timed out");
            match policy {
                ErrorPolicy::AbortOnError => ExitCode::from(2),
                ErrorPolicy::ContinueOnError => ExitCode::SUCCESS,
            }
        }
        Err(err) => {
            tracing::error!(error = %err, "server exited with an error");
            ExitCode::from(1)
        }
    }
}

fn load_configuration(
    profile: &str,
    cli: &Cli,
) -> Result<(ServerOptions, ErrorPolicy), portway_core::config::ConfigError> {
    let config = PortwayConfig::load(profile)?;
    let mut options = config.section::<ServerOptions>()?;

    if let Some(port) = cli.port {
        options.port = port;
    }
    if let Some(host) = &cli.host {
        options.host = host.clone();
    }
    if let Some(dir) = &cli.routes_dir {
        options.routes_dir = dir.clone();
    }

    let policy = if config.get_or("plugins.continue_on_error", true) {
        ErrorPolicy::ContinueOnError
    } else {
        ErrorPolicy::AbortOnError
    };
    Ok((options, policy))
}
