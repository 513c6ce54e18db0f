//! `lobby register`: create an account on the lobby.

use anyhow::{Context, Result};

use super::Target;

pub async fn run(target: &Target) -> Result<()> {
    let password = target.password()?;
    let (client, _notices) = target.connect().await?;
    let message = client
        .register(&target.user, &password)
        .await
        .with_context(|| format!("failed to register {}", target.user))?;
    println!("{message}");
    Ok(())
}
