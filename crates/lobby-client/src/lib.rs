//! lobby-client: Rust client library for the game lobby.
//!
//! Connects to a lobby server, sends commands and surfaces pushed
//! invitations as [`Notice`]s. Once an invite is accepted the
//! [`peer`] module takes the two players onto a direct connection and
//! [`game`] plays the match.
//!
//! # Quick Start
//!
//! ```no_run
//! use lobby_client::LobbyClient;
//!
//! # async fn example() -> lobby_core::LobbyResult<()> {
//! let (client, mut notices) = LobbyClient::connect("127.0.0.1:4000").await?;
//! client.login("alice", "secret").await?;
//!
//! let outcome = client.invite("bob").await?;
//! println!("bob answered {outcome}");
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod game;
pub mod peer;
#[cfg(test)]
mod testing;

// Re-export primary public types.
pub use client::{Invitation, InviteTicket, LobbyClient, Notice};
pub use game::{play, play_and_report, Decision, InviteDecider, MatchOutcome, WhilePlaying};
pub use peer::{host_handoff, join_handoff, HostEndpoint, PeerLink, PeerMessage};

// Re-export lobby-core error types for convenience.
pub use lobby_core::{LobbyError, LobbyResult};
