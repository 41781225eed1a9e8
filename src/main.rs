#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # rtun
//!
//! Reverse tunnel relay. A client behind NAT keeps an outbound control
//! connection to a public relay; the relay listens on public ports for the
//! client's tunnels and splices each user connection onto a work connection
//! the client dialed back.
//!
//! ## Subcommands
//!
//! - `rtun server`: run the public relay
//! - `rtun client`: connect to a relay and expose the configured tunnels
//!
//! ## Status API (when `server.status_addr` is set)
//!
//! | Method | Path            | Description                                  |
//! |--------|-----------------|----------------------------------------------|
//! | GET    | `/api/health`   | Liveness check with uptime and session count |
//! | GET    | `/api/sessions` | Live sessions, their tunnels and idle pool   |

use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use rtun::client::Client;
use rtun::config::Config;
use rtun::server::{status, Server};

/// Reverse tunnel relay and client.
#[derive(Parser)]
#[command(name = "rtun", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the public relay.
    Server {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Connect to a relay and serve the configured tunnels.
    Client {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match cli.command {
        Some(Commands::Client { config }) => run_client(config.as_deref()).await,
        Some(Commands::Server { config }) => run_server(config.as_deref()).await,
        None => {
            let _ = Cli::command().print_help();
            2
        }
    };
    std::process::exit(code);
}

fn load_config(path: Option<&str>) -> Option<Config> {
    match Config::load(path) {
        Ok(config) => {
            let log_filter =
                std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
            tracing_subscriber::fmt().with_env_filter(log_filter).init();
            Some(config)
        }
        Err(e) => {
            eprintln!("rtun: {e}");
            None
        }
    }
}

async fn run_server(config_path: Option<&str>) -> i32 {
    let Some(config) = load_config(config_path) else {
        return 1;
    };
    info!("rtun v{} starting in server mode", env!("CARGO_PKG_VERSION"));
    if config.auth.token.is_empty() {
        warn!("Auth token is empty; any client can log in");
    }

    let server = match Server::bind(&config).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Failed to start relay");
            return 1;
        }
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let status_task = config.server.status_addr.clone().map(|addr| {
        let ctx = server.context();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = status::serve(&addr, ctx, shutdown).await {
                error!(addr = %addr, error = %e, "Status API failed");
            }
        })
    });

    server.run(shutdown).await;
    if let Some(task) = status_task {
        let _ = task.await;
    }
    info!("Goodbye");
    0
}

async fn run_client(config_path: Option<&str>) -> i32 {
    let Some(config) = load_config(config_path) else {
        return 1;
    };
    info!("rtun v{} starting in client mode", env!("CARGO_PKG_VERSION"));
    info!(server = %config.client.server_addr, tunnels = config.tunnels.len(), "Connecting to relay");

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    match Client::from_config(&config).run(shutdown).await {
        Ok(()) => {
            info!("Goodbye");
            0
        }
        Err(e) => {
            error!(error = %e, "Client exited");
            1
        }
    }
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to register SIGTERM handler");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
    shutdown.cancel();
}
