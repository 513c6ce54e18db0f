//! lobby-server: game lobby and rendezvous server.
//!
//! Authenticates players over a line-based TCP protocol, tracks who is
//! online or playing, brokers game invitations and hands accepted matches
//! off to a direct peer-to-peer connection.

mod broker;
mod config;
mod events;
mod handoff;
mod presence;
mod registry;
mod server;
mod store;

use clap::Parser;
use config::{Overrides, ServerConfig};
use events::{EventSink, FileEventLog, NullEventLog};
use server::LobbyServer;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use store::JsonFileStore;
use tracing::{error, info};

/// How long connections get to sign off after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// lobby-server: game lobby and rendezvous server
#[derive(Parser, Debug)]
#[command(name = "lobby-server", version, about = "Game lobby and rendezvous server")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    host: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.lobby/server.toml")]
    config: String,

    /// Seconds a guest has to answer an invite
    #[arg(long)]
    invite_timeout: Option<u64>,

    /// User store (JSON)
    #[arg(long)]
    users_file: Option<String>,

    /// Event log (JSON lines); empty to disable
    #[arg(long)]
    event_log: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting lobby-server");

    let config_path = PathBuf::from(&cli.config);
    let overrides = Overrides {
        host: cli.host,
        port: cli.port,
        invite_timeout_secs: cli.invite_timeout,
        users_file: cli.users_file,
        event_log: cli.event_log,
    };
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let store = Arc::new(JsonFileStore::spawn(server_config.users_file.clone()));
    info!(path = %store.path().display(), "using user store");
    let events: Arc<dyn EventSink> = match &server_config.event_log {
        Some(path) => {
            let log = FileEventLog::spawn(path.clone());
            info!(path = %log.path().display(), "recording lobby events");
            Arc::new(log)
        }
        None => Arc::new(NullEventLog),
    };

    let lobby_server = match LobbyServer::new(server_config, store.clone(), events) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "failed to create server");
            std::process::exit(1);
        }
    };

    // Run until shutdown signal
    tokio::select! {
        result = lobby_server.clone().run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            lobby_server.shutdown();
            lobby_server.drain(SHUTDOWN_GRACE).await;
        }
    }

    store.flush().await;

    info!("lobby-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
