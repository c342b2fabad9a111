//! fdlink Daemon
//!
//! Serves file descriptors to same-user clients over a Unix socket, and
//! fetches them as a client.
//!
//! # Usage
//!
//! ```bash
//! # Serve on the default socket ($XDG_RUNTIME_DIR/fdlink/fdlink.sock)
//! fdlink-daemon serve
//!
//! # Serve with a config file
//! fdlink-daemon serve --config /etc/fdlink.toml
//!
//! # Ask the daemon for a descriptor to a network namespace
//! fdlink-daemon fetch /proc/1/ns/net
//!
//! # With verbose logging
//! RUST_LOG=debug fdlink-daemon serve
//! ```
//!
//! # Environment Variables
//!
//! - `FDLINK_SOCKET`: Custom Unix socket path
//! - `FDLINK_MAX_FDS_PER_WRITE`, `FDLINK_MAX_CACHED_FDS`,
//!   `FDLINK_CONNECT_TIMEOUT`: see [`TransceiverConfig::from_env`]
//! - `RUST_LOG`: Log level (trace, debug, info, warn, error)
//!
//! # Signals
//!
//! - SIGTERM/SIGINT: Graceful shutdown (closes connections, removes socket)

mod service;

use std::os::fd::{AsFd, AsRawFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};

use fdlink_core::{
    DialOption, FdReceiver, FdTransportCredentials, Identity, PeerCredCredentials, RpcClient,
    RpcServer, TransceiverConfig,
};

use crate::service::{DescriptorService, LocatorReply, PathRequest};

/// Pass open file descriptors between processes over a Unix socket
#[derive(Parser, Debug)]
#[command(name = "fdlink-daemon", author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve descriptors until interrupted
    Serve {
        /// Socket to listen on
        #[arg(short, long, env = "FDLINK_SOCKET", value_name = "PATH")]
        socket: Option<PathBuf>,

        /// TOML configuration file (environment variables otherwise)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Ask a running daemon for the descriptor of a path
    Fetch {
        /// Socket of the daemon
        #[arg(short, long, env = "FDLINK_SOCKET", value_name = "PATH")]
        socket: Option<PathBuf>,

        /// Path the daemon should open
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fdlink_daemon=info".parse()?)
                .add_directive("fdlink_core=info".parse()?),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { socket, config } => serve(socket, config).await,
        Command::Fetch { socket, path } => fetch(socket, path).await,
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<TransceiverConfig> {
    match path {
        Some(path) => TransceiverConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(TransceiverConfig::from_env()),
    }
}

async fn serve(socket: Option<PathBuf>, config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path.as_ref())?;
    let socket_path = socket.unwrap_or_else(|| config.socket_path());

    info!(pid = std::process::id(), path = ?socket_path, "Starting fdlink daemon");

    let credentials = FdTransportCredentials::new(Some(Box::new(PeerCredCredentials::new())))
        .with_config(config);
    let server = RpcServer::bind(&socket_path, Some(Box::new(credentials))).with_context(|| {
        format!(
            "Failed to listen on {}. Check if another daemon is running.",
            socket_path.display()
        )
    })?;

    server
        .serve(Arc::new(DescriptorService), shutdown_signal())
        .await;

    info!("fdlink daemon stopped");
    Ok(())
}

async fn fetch(socket: Option<PathBuf>, path: PathBuf) -> Result<()> {
    let config = TransceiverConfig::from_env();
    let socket_path = socket.unwrap_or_else(|| config.socket_path());
    let timeout = Duration::from_millis(config.connect_timeout_ms);

    let credentials = FdTransportCredentials::new(Some(Box::new(PeerCredCredentials::new())))
        .with_config(config);
    let client = RpcClient::dial(
        &socket_path,
        vec![
            DialOption::FdTransportCredentials(credentials),
            DialOption::ConnectTimeout(timeout),
        ],
    )
    .await
    .with_context(|| format!("Failed to connect to {}", socket_path.display()))?;

    let transceiver = client
        .transceiver()
        .context("Connection cannot carry descriptors")?;

    let reply: LocatorReply = client
        .call("open", &PathRequest { path: path.clone() }, &[])
        .await
        .with_context(|| format!("Daemon could not open {}", path.display()))?;

    let receipt = transceiver.recv_file_by_locator(&reply.locator)?;
    let file = tokio::time::timeout(timeout, receipt)
        .await
        .context("Timed out waiting for the descriptor")??;

    let identity = Identity::of_fd(file.as_fd())?;
    let target = nix::fcntl::readlink(format!("/proc/self/fd/{}", file.as_raw_fd()).as_str())
        .map(|t| t.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "?".to_string());

    println!("locator:  {}", reply.locator);
    println!("identity: {identity}");
    println!("fd:       {} -> {target}", file.as_raw_fd());
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}
