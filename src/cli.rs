//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Ephemeral identity broker - short-lived service accounts for one trusted caller
#[derive(Parser, Debug)]
#[command(name = "idbroker")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "IDBROKER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "IDBROKER_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "IDBROKER_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "IDBROKER_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "IDBROKER_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Start the HTTP server (default)
    Serve,

    /// Run one reclamation sweep and print the outcome as JSON
    Reclaim,

    /// Load and validate the configuration, then print it as YAML
    CheckConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_server_mode() {
        let cli = Cli::try_parse_from(["idbroker"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn parses_subcommands_and_overrides() {
        let cli = Cli::try_parse_from([
            "idbroker",
            "--port",
            "9000",
            "reclaim",
            "--config",
            "/etc/idbroker.yaml",
        ])
        .unwrap();
        assert_eq!(cli.command, Some(Command::Reclaim));
        assert_eq!(cli.port, Some(9000));
        assert_eq!(cli.config, Some(PathBuf::from("/etc/idbroker.yaml")));

        let cli = Cli::try_parse_from(["idbroker", "check-config"]).unwrap();
        assert_eq!(cli.command, Some(Command::CheckConfig));
    }
}
