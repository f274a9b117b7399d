// src/main.rs

//! The main entry point for the pvc-bootstrapd daemon.

use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::filter::EnvFilter;

use pvc_bootstrapd::config::{self, Config};
use pvc_bootstrapd::server;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Auto-bootstrap controller for Parallel Virtual Cluster bare-metal hosts.
#[derive(Parser, Debug)]
#[command(name = "pvc-bootstrapd", version = VERSION)]
struct Cli {
    /// Path to the daemon's YAML configuration file.
    #[arg(long, default_value = "/etc/pvc-bootstrapd/config.yml")]
    config: String,

    /// Perform store/spec-repository/TFTP initialization and exit.
    #[arg(long)]
    init_only: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .compact()
        .with_ansi(true)
        .init();

    let config = match Config::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration from \"{}\": {}", cli.config, e);
            return ExitCode::FAILURE;
        }
    };
    config::log_startup_info(&config);

    if cli.init_only {
        return match server::init_only(&config).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("init-only run failed: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    match server::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("server runtime error: {}", e);
            ExitCode::FAILURE
        }
    }
}
