//! Route-Auth Gateway - authenticating route-service proxy

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use route_auth_gateway::{
    cli::{Cli, Command},
    config::{Config, ProviderKind, ServerOverrides},
    gateway::{Gateway, provider::ProviderSettings},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = setup_tracing(
        &cli.log_level,
        cli.log_format.as_deref(),
        &provider_log_directives(&config),
    ) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Check) => run_check(&config),
        Some(Command::Serve) | None => run_server(config, cli).await,
    }
}

/// Load the config file and apply command-line overrides
fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load(cli.config.as_deref()).with_context(|| {
        cli.config.as_ref().map_or_else(
            || "loading configuration from environment".to_string(),
            |p| format!("loading {}", p.display()),
        )
    })?;

    server_overrides(cli).apply(&mut config);
    config.validate().context("validating command-line overrides")?;

    Ok(config)
}

fn server_overrides(cli: &Cli) -> ServerOverrides {
    ServerOverrides {
        host: cli.host.clone(),
        port: cli.port,
    }
}

fn provider_log_directives(config: &Config) -> Vec<String> {
    if config.provider.kind != ProviderKind::Remote {
        return Vec::new();
    }
    ProviderSettings::from_properties(&config.properties)
        .ok()
        .and_then(|s| s.log_directive())
        .into_iter()
        .collect()
}

/// Print the effective configuration
fn run_check(config: &Config) -> ExitCode {
    match serde_yaml::to_string(&config.redacted()) {
        Ok(yaml) => {
            println!("Configuration OK\n");
            println!("{yaml}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to render configuration: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the gateway server
async fn run_server(config: Config, cli: Cli) -> ExitCode {
    let overrides = server_overrides(&cli);
    let gateway = match Gateway::new(config, cli.config) {
        Ok(g) => g.with_overrides(overrides),
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
