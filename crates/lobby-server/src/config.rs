//! Server configuration: TOML file + CLI overrides.

use lobby_core::{LobbyError, LobbyResult, DEFAULT_MAX_LINE};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub storage: StorageSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_invite_timeout")]
    pub invite_timeout_secs: u64,
    #[serde(default = "default_handoff_timeout")]
    pub handoff_timeout_secs: u64,
    #[serde(default = "default_max_line")]
    pub max_line_bytes: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            invite_timeout_secs: default_invite_timeout(),
            handoff_timeout_secs: default_handoff_timeout(),
            max_line_bytes: default_max_line(),
        }
    }
}

/// `[storage]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_users_file")]
    pub users_file: String,
    #[serde(default = "default_event_log")]
    pub event_log: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            users_file: default_users_file(),
            event_log: default_event_log(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    4000
}
fn default_invite_timeout() -> u64 {
    15
}
fn default_handoff_timeout() -> u64 {
    30
}
fn default_max_line() -> usize {
    DEFAULT_MAX_LINE
}
fn default_users_file() -> String {
    "~/.lobby/users.json".to_string()
}
fn default_event_log() -> String {
    "~/.lobby/events.jsonl".to_string()
}

/// Values given on the command line; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub invite_timeout_secs: Option<u64>,
    pub users_file: Option<String>,
    pub event_log: Option<String>,
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub invite_timeout: Duration,
    pub handoff_timeout: Duration,
    pub max_line_bytes: usize,
    pub users_file: PathBuf,
    pub event_log: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::resolve(ConfigFile::default(), Overrides::default())
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: Overrides) -> LobbyResult<Self> {
        let file_config = match config_path.map(expand_tilde) {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "loading config file");
                let content = std::fs::read_to_string(&path)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| LobbyError::Other(format!("config parse error: {e}")))?
            }
            Some(path) => {
                info!(path = %path.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
            None => ConfigFile::default(),
        };
        Ok(Self::resolve(file_config, overrides))
    }

    fn resolve(file: ConfigFile, overrides: Overrides) -> Self {
        let event_log = overrides.event_log.unwrap_or(file.storage.event_log);
        Self {
            host: overrides.host.unwrap_or(file.server.host),
            port: overrides.port.unwrap_or(file.server.port),
            invite_timeout: Duration::from_secs(
                overrides
                    .invite_timeout_secs
                    .unwrap_or(file.server.invite_timeout_secs),
            ),
            handoff_timeout: Duration::from_secs(file.server.handoff_timeout_secs),
            max_line_bytes: file.server.max_line_bytes,
            users_file: expand_tilde_str(
                &overrides.users_file.unwrap_or(file.storage.users_file),
            ),
            // An empty path turns the event log off.
            event_log: (!event_log.is_empty()).then(|| expand_tilde_str(&event_log)),
        }
    }

    /// `host:port` to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    expand_tilde_str(&path.to_string_lossy())
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
