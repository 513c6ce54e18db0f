//! `lobby online` / `lobby playing`: list players.

use anyhow::{Context, Result};

use super::Target;

/// Which presence list to show.
#[derive(Debug, Clone, Copy)]
pub enum Listing {
    Online,
    Playing,
}

pub async fn run(target: &Target, listing: Listing) -> Result<()> {
    let (client, _notices) = target.login().await?;
    let users = match listing {
        Listing::Online => client.list_online().await,
        Listing::Playing => client.list_playing().await,
    }
    .context("failed to list players")?;
    print_users(listing, &users);

    // Best effort; the server signs us off on disconnect anyway.
    let _ = client.logout().await;
    Ok(())
}

pub fn print_users(listing: Listing, users: &[String]) {
    let label = match listing {
        Listing::Online => "online",
        Listing::Playing => "playing",
    };
    if users.is_empty() {
        println!("Nobody is {label}.");
        return;
    }
    for user in users {
        println!("  {user}");
    }
    println!("{} player(s) {label}.", users.len());
}
