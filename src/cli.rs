//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Authenticating route-service gateway
#[derive(Parser, Debug)]
#[command(name = "route-auth-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "ROUTE_AUTH_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "ROUTE_AUTH_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "ROUTE_AUTH_GATEWAY_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "ROUTE_AUTH_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "ROUTE_AUTH_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Load and validate the configuration, then print it with secrets masked
    Check,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_check_with_config() {
        let cli = Cli::parse_from(["route-auth-gateway", "check", "--config", "gw.yaml"]);
        assert!(matches!(cli.command, Some(Command::Check)));
        assert_eq!(cli.config, Some(PathBuf::from("gw.yaml")));
    }

    #[test]
    fn defaults_to_server_mode() {
        let cli = Cli::parse_from(["route-auth-gateway", "--port", "9000"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.port, Some(9000));
    }
}
