//! Handoff coordinator: ACCEPTED invite → direct peer connection.
//!
//! After an invite is accepted the host opens an ephemeral listener and
//! reports its port; the coordinator forwards the host's address to the
//! guest and flips both players to PLAYING. No game traffic passes through
//! the lobby. A handoff is retired when either side reports `GAME_START`,
//! and force-failed on deadline expiry or when either party disconnects.
//!
//! The handoff table lock is never held while calling into presence or the
//! registry.

use crate::events::{EventSink, LobbyEvent};
use crate::presence::PresenceTable;
use crate::registry::SessionRegistry;
use lobby_core::{InviteToken, LobbyError, LobbyResult, ServerMessage, Status};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// An accepted invite waiting for the peers to connect.
#[derive(Debug, Clone)]
pub struct HandoffSession {
    pub token: InviteToken,
    pub host: String,
    pub guest: String,
    /// Port of the host's listener, once reported.
    pub port: Option<u16>,
    pub deadline: Instant,
}

impl HandoffSession {
    fn involves(&self, user: &str) -> bool {
        self.host == user || self.guest == user
    }

    fn other(&self, user: &str) -> &str {
        if self.host == user {
            &self.guest
        } else {
            &self.host
        }
    }
}

pub struct HandoffCoordinator {
    sessions: Mutex<HashMap<InviteToken, HandoffSession>>,
    /// Established matches, both directions: player → opponent.
    matches: Mutex<HashMap<String, String>>,
    presence: Arc<PresenceTable>,
    registry: Arc<SessionRegistry>,
    events: Arc<dyn EventSink>,
    timeout: Duration,
}

impl HandoffCoordinator {
    pub fn new(
        presence: Arc<PresenceTable>,
        registry: Arc<SessionRegistry>,
        events: Arc<dyn EventSink>,
        timeout: Duration,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            matches: Mutex::new(HashMap::new()),
            presence,
            registry,
            events,
            timeout,
        }
    }

    /// Open a handoff for an accepted invite and arm its expiry timer.
    pub async fn open(self: &Arc<Self>, token: InviteToken, host: &str, guest: &str) {
        let deadline = Instant::now() + self.timeout;
        let session = HandoffSession {
            token: token.clone(),
            host: host.to_string(),
            guest: guest.to_string(),
            port: None,
            deadline,
        };
        self.sessions.lock().await.insert(token.clone(), session);
        // A guest who left a match to accept this invite is no longer paired
        // with that opponent, whose GAME_OVER must not reset the guest.
        {
            let mut matches = self.matches.lock().await;
            for user in [host, guest] {
                if let Some(previous) = unpair(&mut matches, user) {
                    debug!(user = %user, previous = %previous, "left earlier match");
                }
            }
        }
        info!(token = %token, host = %host, guest = %guest, "handoff opened");

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            this.expire(&token).await;
        });
    }

    /// `SEND_GUEST_CONN_PORT`: relay the host's endpoint to the guest.
    pub async fn report_port(&self, host: &str, guest: &str, port: u16) -> LobbyResult<()> {
        let token = {
            let mut sessions = self.sessions.lock().await;
            let session = sessions
                .values_mut()
                .find(|s| s.host == host && s.guest == guest)
                .ok_or_else(|| LobbyError::NotFound(format!("no handoff pending with {guest}")))?;
            if let Some(sent) = session.port {
                return Err(LobbyError::Conflict(format!(
                    "connect target already sent (port {sent})"
                )));
            }
            session.port = Some(port);
            let remaining = session.deadline.saturating_duration_since(Instant::now());
            debug!(
                token = %session.token,
                remaining_ms = remaining.as_millis() as u64,
                "host listener reported"
            );
            session.token.clone()
        };

        let Some(addr) = self.presence.last_address(host).await else {
            self.fail(&token, "host address unknown").await;
            return Err(LobbyError::Offline);
        };
        let connect_to = ServerMessage::ConnectTo {
            token: token.clone(),
            host: host.to_string(),
            addr: addr.ip(),
            port,
        };
        if !self.registry.notify(guest, connect_to).await {
            self.fail(&token, "guest not connected").await;
            return Err(LobbyError::Conflict("guest not connected".into()));
        }

        if let Err(e) = self.presence.start_match(host, guest).await {
            self.fail(&token, "player left before the match started").await;
            return Err(e);
        }
        self.announce(host, Status::Playing).await;
        self.announce(guest, Status::Playing).await;

        info!(token = %token, host = %host, guest = %guest, port, "connect target relayed");
        self.events.record(LobbyEvent::HandoffStarted {
            token,
            host: host.to_string(),
            guest: guest.to_string(),
            port,
        });
        Ok(())
    }

    /// `GAME_START`: the peer connection is up. Retires the handoff and
    /// records the match. Repeating it for a live match is a no-op.
    pub async fn establish(&self, host: &str, guest: &str) -> LobbyResult<()> {
        let retired = {
            let mut sessions = self.sessions.lock().await;
            let token = sessions
                .values()
                .find(|s| s.host == host && s.guest == guest)
                .map(|s| s.token.clone());
            token.and_then(|t| sessions.remove(&t))
        };

        let mut matches = self.matches.lock().await;
        let Some(session) = retired else {
            return if matches.get(host).map(String::as_str) == Some(guest) {
                Ok(())
            } else {
                Err(LobbyError::NotFound(format!("no handoff between {host} and {guest}")))
            };
        };
        matches.insert(host.to_string(), guest.to_string());
        matches.insert(guest.to_string(), host.to_string());
        drop(matches);

        // Normally already PLAYING from the port report.
        if let Err(e) = self.presence.start_match(host, guest).await {
            warn!(host = %host, guest = %guest, error = %e, "match established without both players");
        }
        info!(token = %session.token, host = %host, guest = %guest, "peer connection established");
        self.events.record(LobbyEvent::HandoffCompleted {
            token: session.token,
            host: host.to_string(),
            guest: guest.to_string(),
        });
        Ok(())
    }

    /// `GAME_OVER`: return the user, and the opponent of their current
    /// match, to ONLINE. Also retires a handoff that never got established,
    /// e.g. when the host's accept window lapsed.
    pub async fn game_over(&self, user: &str) {
        let opponent = unpair(&mut *self.matches.lock().await, user);
        let retired = self.take_involving(user).await;

        if self.presence.end_match(user).await {
            self.announce(user, Status::Online).await;
        }
        if let Some(opponent) = &opponent {
            if self.presence.end_match(opponent).await {
                self.announce(opponent, Status::Online).await;
            }
        }
        for session in retired {
            let other = session.other(user).to_string();
            if self.presence.end_match(&other).await {
                self.announce(&other, Status::Online).await;
            }
            self.registry
                .notify(
                    &other,
                    ServerMessage::HandoffAborted {
                        token: session.token.clone(),
                        reason: format!("{user} cancelled the match"),
                    },
                )
                .await;
            self.events.record(LobbyEvent::HandoffFailed {
                token: session.token,
                host: session.host,
                guest: session.guest,
                reason: "cancelled".into(),
            });
        }

        info!(user = %user, opponent = ?opponent, "match over");
        self.events.record(LobbyEvent::MatchOver {
            user: user.to_string(),
            opponent,
        });
    }

    /// Deadline expiry. No-op if the handoff was already retired.
    pub async fn expire(&self, token: &InviteToken) {
        let exists = self.sessions.lock().await.contains_key(token);
        if exists {
            warn!(token = %token, "handoff deadline passed");
            self.fail(token, "peer connection not established in time").await;
        }
    }

    /// Disconnect cleanup: fail every handoff involving `user` and forget
    /// its match pairing. An opponent mid-match detects the loss itself.
    pub async fn abort_for(&self, user: &str) -> usize {
        unpair(&mut *self.matches.lock().await, user);
        let sessions = self.take_involving(user).await;
        let count = sessions.len();
        for session in sessions {
            self.fail_session(session, &format!("{user} disconnected")).await;
        }
        count
    }

    /// Whether `user` is party to an open handoff.
    pub async fn involves(&self, user: &str) -> bool {
        self.sessions.lock().await.values().any(|s| s.involves(user))
    }

    /// Current opponent of `user`, if a match is established.
    pub async fn opponent(&self, user: &str) -> Option<String> {
        self.matches.lock().await.get(user).cloned()
    }

    pub async fn open_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    async fn take_involving(&self, user: &str) -> Vec<HandoffSession> {
        let mut sessions = self.sessions.lock().await;
        let tokens: Vec<InviteToken> = sessions
            .values()
            .filter(|s| s.involves(user))
            .map(|s| s.token.clone())
            .collect();
        tokens.iter().filter_map(|t| sessions.remove(t)).collect()
    }

    async fn fail(&self, token: &InviteToken, reason: &str) {
        let session = self.sessions.lock().await.remove(token);
        if let Some(session) = session {
            self.fail_session(session, reason).await;
        }
    }

    /// Both players back to ONLINE and told why.
    async fn fail_session(&self, session: HandoffSession, reason: &str) {
        for user in [&session.host, &session.guest] {
            if self.presence.end_match(user).await {
                self.announce(user, Status::Online).await;
            }
            self.registry
                .notify(
                    user,
                    ServerMessage::HandoffAborted {
                        token: session.token.clone(),
                        reason: reason.to_string(),
                    },
                )
                .await;
        }
        info!(token = %session.token, reason = %reason, "handoff failed");
        self.events.record(LobbyEvent::HandoffFailed {
            token: session.token,
            host: session.host,
            guest: session.guest,
            reason: reason.to_string(),
        });
    }

    async fn announce(&self, user: &str, status: Status) {
        if !self
            .registry
            .notify(user, ServerMessage::StatusChanged { status })
            .await
        {
            debug!(user = %user, status = %status, "status change not delivered");
        }
    }
}

/// Drop `user`'s pairing, and its opponent's when it points back. Returns
/// the opponent only for a mutual pairing.
fn unpair(matches: &mut HashMap<String, String>, user: &str) -> Option<String> {
    let opponent = matches.remove(user)?;
    if matches.get(&opponent).map(String::as_str) == Some(user) {
        matches.remove(&opponent);
        Some(opponent)
    } else {
        None
    }
}
