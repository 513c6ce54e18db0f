//! CLI subcommand implementations.

pub mod list;
pub mod play;
pub mod register;

use anyhow::{Context, Result};
use lobby_client::{LobbyClient, Notice};
use tokio::sync::mpsc;
use tracing::info;

/// Where to connect and who to be.
#[derive(Debug, Clone)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Prompted for when absent.
    pub password: Option<String>,
}

impl Target {
    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn password(&self) -> Result<String> {
        match &self.password {
            Some(p) => Ok(p.clone()),
            None => dialoguer::Password::new()
                .with_prompt(format!("Password for {}", self.user))
                .interact()
                .context("failed to read password"),
        }
    }

    /// Connect without logging in.
    pub async fn connect(&self) -> Result<(LobbyClient, mpsc::UnboundedReceiver<Notice>)> {
        let addr = self.addr();
        LobbyClient::connect(addr.as_str())
            .await
            .with_context(|| format!("failed to connect to lobby at {addr}"))
    }

    /// Connect and log in.
    pub async fn login(&self) -> Result<(LobbyClient, mpsc::UnboundedReceiver<Notice>)> {
        let password = self.password()?;
        let (client, notices) = self.connect().await?;
        client
            .login(&self.user, &password)
            .await
            .with_context(|| format!("login as {} failed", self.user))?;
        info!(user = %self.user, "logged in");
        Ok((client, notices))
    }
}
