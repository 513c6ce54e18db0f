//! `lobby play`: stay in the lobby, trade invites and play matches.
//!
//! Reads commands from stdin while printing what the lobby pushes. Our own
//! invites resolve in the background; an accepted one (either direction)
//! moves us onto a direct connection with the other player for a dice duel,
//! after which we are back at the prompt.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use anyhow::{Context, Result};
use lobby_client::{
    host_handoff, join_handoff, play_and_report, Decision, InviteDecider, Invitation,
    LobbyClient, LobbyError, LobbyResult, MatchOutcome, Notice, PeerLink, WhilePlaying,
};
use lobby_core::{InviteOutcome, InviteToken};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::debug;

use super::list::{print_users, Listing};
use super::Target;
use crate::config::PlayConfig;

/// How long a guest tries to reach the host's match listener.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const HELP: &str =
    "commands: invite <user> | accept | decline | list | playing | available | help | quit";

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Invite(String),
    Accept,
    Decline,
    List,
    Playing,
    Available,
    Help,
    Quit,
    Unknown(String),
}

impl Input {
    /// `None` for blank lines.
    fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        let command = words.next()?;
        let input = match (command, words.next()) {
            ("invite", Some(user)) => Input::Invite(user.to_string()),
            ("accept", None) => Input::Accept,
            ("decline", None) => Input::Decline,
            ("list" | "online", None) => Input::List,
            ("playing", None) => Input::Playing,
            ("available", None) => Input::Available,
            ("help" | "?", None) => Input::Help,
            ("quit" | "exit", None) => Input::Quit,
            _ => Input::Unknown(line.trim().to_string()),
        };
        Some(input)
    }
}

/// Applies the configured policy and tells the user what happened.
struct Announce(WhilePlaying);

impl InviteDecider for Announce {
    fn decide(&mut self, invitation: &Invitation) -> Decision {
        let decision = self.0.decide(invitation);
        match decision {
            Decision::Accept => {
                println!("{} invited you mid-match; leaving to accept.", invitation.host)
            }
            Decision::Decline => println!("{} invited you mid-match; declined.", invitation.host),
        }
        decision
    }
}

type InviteResult = (String, LobbyResult<InviteOutcome>);

struct Session {
    client: LobbyClient,
    notices: mpsc::UnboundedReceiver<Notice>,
    prefs: PlayConfig,
    decider: Announce,
    /// Most recent invitation shown to us, answered by a bare accept/decline.
    last_invitation: Option<Invitation>,
    results: mpsc::UnboundedSender<InviteResult>,
}

pub async fn run(target: &Target, prefs: PlayConfig) -> Result<()> {
    let (client, notices) = target.login().await?;
    let (results_tx, mut results_rx) = mpsc::unbounded_channel();
    let mut session = Session {
        client,
        notices,
        decider: Announce(prefs.while_playing),
        prefs,
        last_invitation: None,
        results: results_tx,
    };

    println!("Logged in as {}. {HELP}", target.user);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                match Input::parse(&line) {
                    Some(Input::Quit) => break,
                    Some(input) => session.command(input).await?,
                    None => {}
                }
            }
            notice = session.notices.recv() => {
                let Some(notice) = notice else {
                    println!("Lost connection to the lobby.");
                    break;
                };
                session.notice(notice).await?;
            }
            Some((guest, result)) = results_rx.recv() => {
                session.invite_resolved(&guest, result).await?;
            }
        }
    }

    if session.client.is_connected() {
        let _ = session.client.logout().await;
    }
    Ok(())
}

impl Session {
    async fn command(&mut self, input: Input) -> Result<()> {
        match input {
            Input::Invite(guest) => match self.client.send_invite(&guest).await {
                Ok(ticket) => {
                    println!(
                        "Invited {guest}; waiting up to {}s for an answer.",
                        ticket.expires_in.as_secs()
                    );
                    let results = self.results.clone();
                    tokio::spawn(async move {
                        let outcome = ticket.outcome().await;
                        let _ = results.send((guest, outcome));
                    });
                }
                Err(e) => report(e)?,
            },
            Input::Accept => {
                let token = self.take_invitation();
                match self.client.accept(token.as_ref()).await {
                    Ok(message) => println!("{message}"),
                    Err(e) => report(e)?,
                }
            }
            Input::Decline => {
                let token = self.take_invitation();
                match self.client.decline(token.as_ref()).await {
                    Ok(message) => println!("{message}"),
                    Err(e) => report(e)?,
                }
            }
            Input::List => match self.client.list_online().await {
                Ok(users) => print_users(Listing::Online, &users),
                Err(e) => report(e)?,
            },
            Input::Playing => match self.client.list_playing().await {
                Ok(users) => print_users(Listing::Playing, &users),
                Err(e) => report(e)?,
            },
            Input::Available => match self.client.available().await {
                Ok(message) => println!("{message}"),
                Err(e) => report(e)?,
            },
            Input::Help => println!("{HELP}"),
            Input::Unknown(line) => println!("unknown command: {line}\n{HELP}"),
            Input::Quit => {}
        }
        Ok(())
    }

    async fn notice(&mut self, notice: Notice) -> Result<()> {
        match notice {
            Notice::Invitation(invitation) => {
                let left = invitation
                    .expires_at
                    .saturating_duration_since(tokio::time::Instant::now());
                println!("{} [{}]", invitation.message, invitation.token);
                println!("Type accept or decline within {}s.", left.as_secs());
                self.last_invitation = Some(invitation);
            }
            Notice::InviteClosed { token, outcome } => {
                if self
                    .last_invitation
                    .as_ref()
                    .is_some_and(|inv| inv.token == token)
                {
                    self.last_invitation = None;
                }
                println!("Invite {token} closed: {outcome}.");
                if outcome == InviteOutcome::Timeout {
                    println!("You will not get new invites until you type `available`.");
                }
            }
            Notice::ConnectTo { host, addr, .. } => {
                self.last_invitation = None;
                println!("Joining {host}'s match at {addr}...");
                match join_handoff(&self.client, &host, addr, CONNECT_TIMEOUT).await {
                    Ok(link) => self.play_match(link, &host).await?,
                    Err(e) => {
                        println!("Could not join {host}: {e}");
                        if let Err(e) = self.client.game_over().await {
                            report(e)?;
                        }
                    }
                }
            }
            Notice::HandoffAborted { reason, .. } => println!("Match setup aborted: {reason}."),
            Notice::StatusChanged(status) => debug!(status = %status, "presence changed"),
        }
        Ok(())
    }

    async fn invite_resolved(
        &mut self,
        guest: &str,
        result: LobbyResult<InviteOutcome>,
    ) -> Result<()> {
        match result {
            Ok(InviteOutcome::Accepted) => {
                println!("{guest} accepted. Waiting for them to connect...");
                let bind_ip = listen_ip(&self.client);
                match host_handoff(&self.client, guest, bind_ip, self.prefs.accept_window()).await
                {
                    Ok(link) => self.play_match(link, guest).await?,
                    Err(e) => report(e)?,
                }
            }
            Ok(outcome) => println!("Invite to {guest}: {outcome}."),
            Err(e) => report(e)?,
        }
        Ok(())
    }

    async fn play_match(&mut self, mut link: PeerLink, opponent: &str) -> Result<()> {
        println!(
            "Match against {opponent} started ({} rounds).",
            self.prefs.rounds
        );
        let outcome = play_and_report(
            &mut link,
            opponent,
            self.prefs.rounds,
            &mut self.notices,
            &mut self.decider,
            &self.client,
        )
        .await;
        match outcome {
            Ok(MatchOutcome::Abandoned { .. }) => println!("Left the match against {opponent}."),
            Ok(outcome) => println!("Match against {opponent}: {outcome}."),
            Err(e) => report(e)?,
        }
        Ok(())
    }

    fn take_invitation(&mut self) -> Option<InviteToken> {
        self.last_invitation
            .take()
            .filter(|inv| !inv.is_expired())
            .map(|inv| inv.token)
    }
}

/// Print a lobby error and carry on, unless the lobby itself is gone.
fn report(err: LobbyError) -> Result<()> {
    if matches!(err, LobbyError::ConnectionLost) {
        return Err(err).context("lobby connection lost");
    }
    println!("error: {err}");
    Ok(())
}

fn listen_ip(client: &LobbyClient) -> IpAddr {
    match client.local_addr().ip() {
        IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    }
}
