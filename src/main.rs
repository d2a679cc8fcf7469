// hostconsole - Main Entry Point
//
// - serve: run the operator terminal server until Ctrl-C
// - check: run the command allow-list offline against one command line

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hostconsole::config::Config;
use hostconsole::terminal::CommandAllowlist;
use hostconsole::{logging, server};
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// hostconsole: operator web console for host diagnostics
#[derive(Parser, Debug)]
#[command(name = "hostconsole")]
#[command(version)]
#[command(about = "Run allow-listed diagnostic commands over a WebSocket", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the terminal server
    Serve {
        /// Path to the config file (default: ~/.config/hostconsole/config.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Address to bind
        #[arg(long)]
        bind: Option<IpAddr>,

        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,
    },
    /// Check whether a command line passes the allow-list
    Check {
        /// Command name
        command: String,

        /// Arguments, as the operator would send them
        #[arg(allow_hyphen_values = true, trailing_var_arg = true)]
        args: Vec<String>,
    },
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();

    match args.command {
        Commands::Serve { config, bind, port } => {
            let path = config.unwrap_or_else(Config::config_path);
            let mut config =
                Config::load_from_path(&path).context("Failed to load configuration")?;
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(port) = port {
                config.server.port = port;
            }

            logging::init(&config.logging, args.verbose)?;
            if path.exists() {
                info!("Loaded configuration from {:?}", path);
            } else {
                info!("Config file not found at {:?}, using defaults", path);
            }
            serve(config)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Check { command, args } => Ok(check(&command, &args)),
    }
}

#[tokio::main]
async fn serve(config: Config) -> Result<()> {
    info!("hostconsole v{} starting", env!("CARGO_PKG_VERSION"));

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C, shutting down");
                signal_token.cancel();
            }
            Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    server::serve(config, shutdown).await
}

fn check(command: &str, args: &[String]) -> ExitCode {
    match CommandAllowlist::default().validate(command, args) {
        Ok(validated) => {
            println!("allowed: {}", validated);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("rejected: {}", e);
            ExitCode::FAILURE
        }
    }
}
