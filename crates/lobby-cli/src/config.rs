//! Client configuration at `~/.lobby/config.toml`.
//!
//! Provides the default lobby address and username plus match preferences.
//! CLI flags always override config file values.

use anyhow::{Context, Result};
use lobby_client::WhilePlaying;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Default connection settings.
    #[serde(default)]
    pub default: DefaultConfig,

    /// Match preferences.
    #[serde(default)]
    pub play: PlayConfig,
}

/// Default connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultConfig {
    /// Lobby host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Lobby port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username to log in as (empty = must be given on the command line).
    #[serde(default)]
    pub username: String,
}

impl Default for DefaultConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayConfig {
    /// How long a host waits for the guest to connect after ACCEPTED.
    #[serde(default = "default_accept_window")]
    pub accept_window_secs: u64,

    #[serde(default = "default_rounds")]
    pub rounds: u32,

    /// What to do with invitations received mid-match.
    #[serde(default)]
    pub while_playing: WhilePlaying,
}

impl Default for PlayConfig {
    fn default() -> Self {
        Self {
            accept_window_secs: default_accept_window(),
            rounds: default_rounds(),
            while_playing: WhilePlaying::default(),
        }
    }
}

impl PlayConfig {
    pub fn accept_window(&self) -> Duration {
        Duration::from_secs(self.accept_window_secs)
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4000
}

fn default_accept_window() -> u64 {
    20
}

fn default_rounds() -> u32 {
    5
}

/// `~/.lobby/config.toml`.
pub fn default_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".lobby")
        .join("config.toml")
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }
}
