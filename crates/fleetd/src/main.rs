//! Command-line entry point for the fleet launcher daemon.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use fleet_launcher::LauncherConfig;
use fleet_state::StateStore;
use fleetd::{ApiClient, Daemon, STORE_FILE, StatusReport, submit_request};
use tokio::sync::watch;
use tracing::{error, info};

/// API address used when `--server` is not given.
const DEFAULT_SERVER: &str = "127.0.0.1:7780";

#[derive(Parser)]
#[command(name = "fleetd", about = "Fleet launcher daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a launcher for every pool in the config.
    Run {
        /// Launcher configuration file (TOML).
        #[arg(long)]
        config: PathBuf,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/fleet")]
        data_dir: PathBuf,

        /// Launcher name, used as the prefix of every launcher id.
        #[arg(long, default_value = "fleetd")]
        name: String,

        /// Address for the REST API; omit to run without one.
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
    /// Submit a node request.
    Submit {
        /// API address of a running daemon (`host:port`).
        #[arg(long, conflicts_with = "data_dir")]
        server: Option<String>,

        /// Write straight into the store of a stopped daemon.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Node label; repeat once per node.
        #[arg(long = "label", required = true)]
        labels: Vec<String>,

        #[arg(long, default_value = "fleetd")]
        requestor: String,
    },
    /// Print requests and nodes as JSON.
    Status {
        #[arg(long, conflicts_with = "data_dir")]
        server: Option<String>,

        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,fleetd=debug,fleet_launcher=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            name,
            listen,
        } => run(&config, &data_dir, &name, listen).await,
        Command::Submit {
            server,
            data_dir,
            labels,
            requestor,
        } => {
            let request = match data_dir {
                Some(data_dir) => submit_request(&open_store(&data_dir)?, &requestor, labels)?,
                None => ApiClient::new(&server_address(server)).submit(&requestor, labels).await?,
            };
            println!("{}", request.id);
            Ok(())
        }
        Command::Status { server, data_dir } => {
            let report = match data_dir {
                Some(data_dir) => StatusReport::collect(&open_store(&data_dir)?)?,
                None => ApiClient::new(&server_address(server)).status().await?,
            };
            println!("{}", report.to_json()?);
            Ok(())
        }
    }
}

fn server_address(server: Option<String>) -> String {
    server.unwrap_or_else(|| DEFAULT_SERVER.to_string())
}

/// The store file is held exclusively: a running daemon's store is only
/// reachable through its API.
fn open_store(data_dir: &Path) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join(STORE_FILE);
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    Ok(store)
}

async fn run(
    config_path: &Path,
    data_dir: &Path,
    name: &str,
    listen: Option<SocketAddr>,
) -> anyhow::Result<()> {
    info!(name, "fleet launcher starting");
    let config = LauncherConfig::from_file(config_path)?;
    let store = open_store(data_dir)?;
    let daemon = Daemon::new(store, &config, name)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal received"),
            Err(e) => error!(error = %e, "failed to listen for ctrl-c; shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    let server = match listen {
        Some(addr) => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!(%addr, "API server starting");
            let router = daemon.router();
            let mut api_shutdown = shutdown_rx.clone();
            Some(tokio::spawn(async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(async move {
                        let _ = api_shutdown.wait_for(|stop| *stop).await;
                    })
                    .await
            }))
        }
        None => None,
    };

    daemon.run(shutdown_rx).await?;
    if let Some(server) = server {
        server.await??;
        info!("API server stopped");
    }
    Ok(())
}
