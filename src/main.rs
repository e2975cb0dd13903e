//! idbroker - ephemeral identity broker
//!
//! Short-lived service accounts for one trusted caller, reclaimed when idle.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use idbroker::{
    cli::{Cli, Command},
    config::Config,
    identity::{Backends, LifecycleManager},
    server::Server,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::CheckConfig) => run_check_config(&cli),
        Some(Command::Reclaim) => run_reclaim(&cli).await,
        Some(Command::Serve) | None => run_server(&cli).await,
    }
}

/// Load configuration and apply CLI overrides
fn load_config(cli: &Cli) -> Option<Config> {
    match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            Some(config)
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            None
        }
    }
}

/// Validate configuration and print it with secrets redacted
fn run_check_config(cli: &Cli) -> ExitCode {
    let Some(mut config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };

    if let Err(e) = config.validate() {
        eprintln!("❌ {e}");
        return ExitCode::FAILURE;
    }

    if config.google.access_token.is_some() {
        config.google.access_token = Some("<redacted>".to_string());
    }

    match serde_yaml::to_string(&config) {
        Ok(yaml) => {
            println!("{yaml}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Failed to serialize configuration: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run one reclamation sweep and print the tally
async fn run_reclaim(cli: &Cli) -> ExitCode {
    let Some(config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    let backends = match Backends::from_config(&config) {
        Ok(b) => b,
        Err(e) => {
            error!("Failed to create backends: {e}");
            return ExitCode::FAILURE;
        }
    };
    let manager = LifecycleManager::new(
        backends.store,
        backends.provider,
        config.google.project_id.clone(),
    );

    match manager.reclaim_expired(config.lifecycle.reclaim_after).await {
        Ok(tally) => match serde_json::to_string(&tally) {
            Ok(json) => {
                println!("{json}");
                if tally.failed > 0 {
                    ExitCode::FAILURE
                } else {
                    ExitCode::SUCCESS
                }
            }
            Err(e) => {
                error!("Failed to serialize tally: {e}");
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            error!("Reclamation failed: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the HTTP server
async fn run_server(cli: &Cli) -> ExitCode {
    let Some(config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        backend = ?config.backend,
        "Starting idbroker"
    );

    let backends = match Backends::from_config(&config) {
        Ok(b) => b,
        Err(e) => {
            error!("Failed to create backends: {e}");
            return ExitCode::FAILURE;
        }
    };

    let server = match Server::new(config, backends) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to create server: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.run().await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Shutdown complete");
    ExitCode::SUCCESS
}
