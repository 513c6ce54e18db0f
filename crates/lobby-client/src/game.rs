//! Dice duel played over a `PeerLink`.
//!
//! Each round both players roll 1..=6 and swap values; the higher total
//! after the last round wins. The match is symmetric, so host and guest run
//! the same loop. Lobby invitations arriving mid-match are handed to an
//! [`InviteDecider`]: accepting abandons the match, declining continues it.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use lobby_core::{InviteToken, LobbyResult};

use crate::client::{Invitation, LobbyClient, Notice};
use crate::peer::{PeerLink, PeerMessage};

/// How a match ended, from our side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Won { mine: u32, theirs: u32 },
    Lost { mine: u32, theirs: u32 },
    Draw { total: u32 },
    /// The peer left or its connection dropped.
    WonByForfeit,
    /// We accepted another invite mid-match.
    Abandoned { token: InviteToken },
}

impl fmt::Display for MatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Won { mine, theirs } => write!(f, "won {mine}-{theirs}"),
            Self::Lost { mine, theirs } => write!(f, "lost {mine}-{theirs}"),
            Self::Draw { total } => write!(f, "draw at {total}"),
            Self::WonByForfeit => write!(f, "won by forfeit"),
            Self::Abandoned { .. } => write!(f, "abandoned for another game"),
        }
    }
}

/// Answer to an invitation received mid-match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Decline,
}

/// Chooses what to do with an invitation that arrives mid-match.
pub trait InviteDecider: Send {
    fn decide(&mut self, invitation: &Invitation) -> Decision;
}

/// Fixed policy for invitations received while playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WhilePlaying {
    Accept,
    #[default]
    Decline,
}

impl InviteDecider for WhilePlaying {
    fn decide(&mut self, _invitation: &Invitation) -> Decision {
        match self {
            WhilePlaying::Accept => Decision::Accept,
            WhilePlaying::Decline => Decision::Decline,
        }
    }
}

impl FromStr for WhilePlaying {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accept" => Ok(Self::Accept),
            "decline" => Ok(Self::Decline),
            other => Err(format!("expected accept or decline, got {other}")),
        }
    }
}

/// Play a match to completion.
///
/// Returns `WonByForfeit` as soon as the peer goes away. Lobby errors while
/// answering an invitation are logged and the match continues.
pub async fn play(
    link: &mut PeerLink,
    opponent: &str,
    rounds: u32,
    notices: &mut mpsc::UnboundedReceiver<Notice>,
    decider: &mut dyn InviteDecider,
    client: &LobbyClient,
) -> LobbyResult<MatchOutcome> {
    let mut mine = 0u32;
    let mut theirs = 0u32;
    let mut notices_open = true;

    for round in 1..=rounds {
        let value: u8 = rand::thread_rng().gen_range(1..=6);
        if link.send(&PeerMessage::Roll { round, value }).await.is_err() {
            info!(opponent = %opponent, "peer gone, claiming forfeit");
            return Ok(MatchOutcome::WonByForfeit);
        }
        mine += u32::from(value);

        let their_value = loop {
            tokio::select! {
                msg = link.recv() => match msg {
                    Some(PeerMessage::Roll { round: r, value }) if r == round => break value,
                    Some(PeerMessage::Roll { round: r, .. }) => {
                        warn!(expected = round, got = r, "out-of-step roll ignored");
                    }
                    Some(PeerMessage::Hello { .. }) => {}
                    Some(PeerMessage::Leave) | None => {
                        info!(opponent = %opponent, round, "peer gone, claiming forfeit");
                        return Ok(MatchOutcome::WonByForfeit);
                    }
                },
                notice = notices.recv(), if notices_open => match notice {
                    Some(Notice::Invitation(invitation)) => {
                        if let Some(token) = consider(&invitation, decider, client).await {
                            let _ = link.send(&PeerMessage::Leave).await;
                            return Ok(MatchOutcome::Abandoned { token });
                        }
                    }
                    Some(other) => debug!(notice = ?other, "notice during match"),
                    None => notices_open = false,
                },
            }
        };
        theirs += u32::from(their_value);
        debug!(round, mine = value, theirs = their_value, "round played");
    }

    let outcome = match mine.cmp(&theirs) {
        std::cmp::Ordering::Greater => MatchOutcome::Won { mine, theirs },
        std::cmp::Ordering::Less => MatchOutcome::Lost { mine, theirs },
        std::cmp::Ordering::Equal => MatchOutcome::Draw { total: mine },
    };
    info!(opponent = %opponent, outcome = %outcome, "match finished");
    Ok(outcome)
}

/// Answer a mid-match invitation. Returns the token if we accepted it.
async fn consider(
    invitation: &Invitation,
    decider: &mut dyn InviteDecider,
    client: &LobbyClient,
) -> Option<InviteToken> {
    if invitation.is_expired() {
        debug!(token = %invitation.token, "discarding expired invitation");
        return None;
    }
    match decider.decide(invitation) {
        Decision::Accept => match client.accept(Some(&invitation.token)).await {
            Ok(_) => Some(invitation.token.clone()),
            Err(e) => {
                warn!(token = %invitation.token, error = %e, "could not accept, continuing match");
                None
            }
        },
        Decision::Decline => {
            if let Err(e) = client.decline(Some(&invitation.token)).await {
                debug!(token = %invitation.token, error = %e, "decline not needed");
            }
            None
        }
    }
}

/// Play, then report `GAME_OVER` to the lobby unless we abandoned the match
/// for a new one.
pub async fn play_and_report(
    link: &mut PeerLink,
    opponent: &str,
    rounds: u32,
    notices: &mut mpsc::UnboundedReceiver<Notice>,
    decider: &mut dyn InviteDecider,
    client: &LobbyClient,
) -> LobbyResult<MatchOutcome> {
    let outcome = play(link, opponent, rounds, notices, decider, client).await?;
    if !matches!(outcome, MatchOutcome::Abandoned { .. }) {
        client.game_over().await?;
    }
    Ok(outcome)
}
