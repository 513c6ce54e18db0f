//! lobby: game lobby client CLI.
//!
//! Registers accounts, lists who is online or playing, and runs an
//! interactive session for inviting players and playing matches.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use commands::list::Listing;
use commands::Target;
use lobby_client::WhilePlaying;
use std::path::PathBuf;
use tracing::error;

/// lobby: game lobby client
#[derive(Parser)]
#[command(name = "lobby", version, about = "Game lobby client: invite players and play matches")]
struct Cli {
    /// Lobby host
    #[arg(long, global = true)]
    host: Option<String>,

    /// Lobby port
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Username (defaults to the config file's)
    #[arg(short, long, global = true)]
    user: Option<String>,

    /// Password (prompted for when omitted)
    #[arg(long, global = true)]
    password: Option<String>,

    /// Config file path
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create an account
    Register {
        /// Username to register (defaults to --user)
        name: Option<String>,
    },

    /// List players who are online and free to invite
    Online,

    /// List players currently in a match
    Playing,

    /// Log in and stay in the lobby
    Play {
        /// Rounds per match
        #[arg(long)]
        rounds: Option<u32>,

        /// Seconds to wait for a guest to connect after they accept
        #[arg(long)]
        accept_window: Option<u64>,

        /// Invitations received mid-match: accept or decline
        #[arg(long)]
        while_playing: Option<WhilePlaying>,
    },
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

    // Load config file.
    let config_path = cli
        .config
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(config::default_path);
    let cfg = match config::Config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("lobby: {e:#}");
            std::process::exit(1);
        }
    };

    // CLI overrides config.
    let user = match &cli.command {
        Command::Register { name: Some(name) } => Some(name.clone()),
        _ => cli.user.clone(),
    }
    .or_else(|| Some(cfg.default.username.clone()).filter(|u| !u.is_empty()));
    let Some(user) = user else {
        eprintln!("lobby: no username; pass --user or set [default] username in the config");
        std::process::exit(1);
    };
    let target = Target {
        host: cli.host.clone().unwrap_or_else(|| cfg.default.host.clone()),
        port: cli.port.unwrap_or(cfg.default.port),
        user,
        password: cli.password.clone(),
    };

    let result = match cli.command {
        Command::Register { .. } => commands::register::run(&target).await,
        Command::Online => commands::list::run(&target, Listing::Online).await,
        Command::Playing => commands::list::run(&target, Listing::Playing).await,
        Command::Play {
            rounds,
            accept_window,
            while_playing,
        } => {
            let mut prefs = cfg.play.clone();
            if let Some(rounds) = rounds {
                prefs.rounds = rounds;
            }
            if let Some(secs) = accept_window {
                prefs.accept_window_secs = secs;
            }
            if let Some(policy) = while_playing {
                prefs.while_playing = policy;
            }
            commands::play::run(&target, prefs).await
        }
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("lobby: {e:#}");
        std::process::exit(1);
    }
}
