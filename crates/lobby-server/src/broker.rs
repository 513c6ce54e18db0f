//! Invitation broker.
//!
//! Owns the invite table and the PENDING → terminal transition. The host's
//! handler awaits a `oneshot` keyed by the invite token, bounded by the
//! invite deadline; the guest's handler (or the expiry path, or a
//! disconnect) resolves it. Resolution removes the entry under the table
//! lock, so each token settles exactly once and later attempts find nothing.
//!
//! Lock order: invite table → handoff table, invite table → presence.

use crate::events::{EventSink, LobbyEvent};
use crate::handoff::HandoffCoordinator;
use crate::presence::PresenceTable;
use crate::registry::SessionRegistry;
use lobby_core::{
    Answer, InviteOutcome, InviteToken, LobbyError, LobbyResult, ServerMessage, Status,
    TokenIssuer,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, info};

struct InviteEntry {
    host: String,
    guest: String,
    resolver: oneshot::Sender<InviteOutcome>,
}

/// A created invite, held by the host's handler until it resolves.
#[derive(Debug)]
pub struct PendingInvite {
    pub token: InviteToken,
    pub host: String,
    pub guest: String,
    pub deadline: Instant,
    rx: oneshot::Receiver<InviteOutcome>,
}

impl PendingInvite {
    /// Time left until the deadline, for the `Invited` reply.
    pub fn expires_in(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

pub struct InviteBroker {
    invites: Mutex<HashMap<InviteToken, InviteEntry>>,
    issuer: TokenIssuer,
    presence: Arc<PresenceTable>,
    registry: Arc<SessionRegistry>,
    handoffs: Arc<HandoffCoordinator>,
    events: Arc<dyn EventSink>,
    timeout: Duration,
}

impl InviteBroker {
    pub fn new(
        presence: Arc<PresenceTable>,
        registry: Arc<SessionRegistry>,
        handoffs: Arc<HandoffCoordinator>,
        events: Arc<dyn EventSink>,
        timeout: Duration,
    ) -> Self {
        Self {
            invites: Mutex::new(HashMap::new()),
            issuer: TokenIssuer::new(),
            presence,
            registry,
            handoffs,
            events,
            timeout,
        }
    }

    /// `GAME_INI`: check the guards, create the invite and notify the guest.
    pub async fn initiate(&self, host: &str, guest: &str) -> LobbyResult<PendingInvite> {
        let mut invites = self.invites.lock().await;
        // A guest mid-handoff already has its flag back at AVAILABLE; the
        // open handoff is what marks it unavailable.
        let in_handoff = host != guest && self.handoffs.involves(guest).await;
        if host != guest && self.handoffs.involves(host).await {
            return Err(LobbyError::Conflict(
                "finish connecting to your accepted match first".into(),
            ));
        }
        let reservation = self.presence.reserve_invite(host, guest, in_handoff).await?;

        let token = self.issuer.issue();
        let deadline = Instant::now() + self.timeout;
        let (resolver, rx) = oneshot::channel();
        invites.insert(
            token.clone(),
            InviteEntry {
                host: host.to_string(),
                guest: guest.to_string(),
                resolver,
            },
        );
        drop(invites);

        info!(token = %token, host = %host, guest = %guest, "invite created");
        self.events.record(LobbyEvent::InviteCreated {
            token: token.clone(),
            host: host.to_string(),
            guest: guest.to_string(),
        });

        let while_playing = reservation.guest_status == Status::Playing;
        let message = if while_playing {
            format!("{host} invited you to another game")
        } else {
            format!("{host} invited you to a game")
        };
        let invitation = ServerMessage::Invitation {
            token: token.clone(),
            host: host.to_string(),
            while_playing,
            expires_in_ms: self.timeout.as_millis() as u64,
            message,
        };
        if !self.registry.notify(guest, invitation).await {
            debug!(token = %token, guest = %guest, "guest has no live connection, invite only flagged");
        }

        Ok(PendingInvite {
            token,
            host: host.to_string(),
            guest: guest.to_string(),
            deadline,
            rx,
        })
    }

    /// Guest-side resolution. Without a token, answers the guest's single
    /// pending invite.
    pub async fn answer(
        &self,
        guest: &str,
        token: Option<&InviteToken>,
        answer: Answer,
    ) -> LobbyResult<InviteOutcome> {
        let mut invites = self.invites.lock().await;
        let token = match token {
            Some(token) => invites
                .get(token)
                .filter(|e| e.guest == guest)
                .map(|_| token.clone()),
            None => invites
                .iter()
                .find(|(_, e)| e.guest == guest)
                .map(|(t, _)| t.clone()),
        }
        .ok_or_else(|| LobbyError::NotFound("no pending invite".into()))?;

        if let Answer::Garbled(line) = &answer {
            debug!(token = %token, guest = %guest, line = %line, "garbled invite answer");
        }
        let outcome = answer.outcome();
        self.settle(&mut invites, &token, outcome).await;
        Ok(outcome)
    }

    /// Host-side wait for the resolution, bounded by the invite deadline.
    /// Dropping this future does not resolve the invite; call [`abort`].
    ///
    /// [`abort`]: InviteBroker::abort
    pub async fn wait(&self, pending: PendingInvite) -> InviteOutcome {
        let PendingInvite {
            token,
            host,
            guest,
            deadline,
            mut rx,
        } = pending;
        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => InviteOutcome::Aborted,
            Err(_) => match self.expire(&token).await {
                Some(outcome) => {
                    debug!(
                        token = %token,
                        host = %host,
                        guest = %guest,
                        outcome = %outcome,
                        "invite deadline reached"
                    );
                    outcome
                }
                // Lost the race to an answer that landed at the deadline.
                None => rx.try_recv().unwrap_or(InviteOutcome::Aborted),
            },
        }
    }

    /// Deadline expiry: TIMEOUT for an ONLINE guest, IGNORED for a PLAYING
    /// one. `None` if the invite already settled.
    pub async fn expire(&self, token: &InviteToken) -> Option<InviteOutcome> {
        let mut invites = self.invites.lock().await;
        let guest = invites.get(token)?.guest.clone();
        let outcome = match self.presence.status(&guest).await {
            Some(Status::Playing) => InviteOutcome::Ignored,
            Some(Status::Online) => InviteOutcome::Timeout,
            _ => InviteOutcome::Aborted,
        };
        self.settle(&mut invites, token, outcome).await?;
        drop(invites);

        self.close_for_guest(&guest, token, outcome).await;
        Some(outcome)
    }

    /// Force-resolve one invite as ABORTED (host went away mid-wait).
    pub async fn abort(&self, token: &InviteToken) -> Option<InviteOutcome> {
        let mut invites = self.invites.lock().await;
        let entry = self
            .settle(&mut invites, token, InviteOutcome::Aborted)
            .await?;
        drop(invites);
        self.close_for_guest(&entry.guest, token, InviteOutcome::Aborted)
            .await;
        Some(InviteOutcome::Aborted)
    }

    /// Force-resolve every invite `user` is party to as ABORTED.
    pub async fn abort_for(&self, user: &str) -> usize {
        let mut invites = self.invites.lock().await;
        let tokens: Vec<InviteToken> = invites
            .iter()
            .filter(|(_, e)| e.host == user || e.guest == user)
            .map(|(t, _)| t.clone())
            .collect();
        let mut closed = Vec::new();
        for token in &tokens {
            if let Some(entry) = self.settle(&mut invites, token, InviteOutcome::Aborted).await {
                if entry.host == user {
                    closed.push((entry.guest, token.clone()));
                }
            }
        }
        drop(invites);

        for (guest, token) in closed {
            self.close_for_guest(&guest, &token, InviteOutcome::Aborted)
                .await;
        }
        tokens.len()
    }

    /// Whether `user` is host or guest of a PENDING invite.
    pub async fn involves(&self, user: &str) -> bool {
        self.invites
            .lock()
            .await
            .values()
            .any(|e| e.host == user || e.guest == user)
    }

    pub async fn pending_count(&self) -> usize {
        self.invites.lock().await.len()
    }

    /// The single terminal transition. Must be called with the invite table
    /// locked; returns `None` if the token already settled.
    async fn settle(
        &self,
        invites: &mut HashMap<InviteToken, InviteEntry>,
        token: &InviteToken,
        outcome: InviteOutcome,
    ) -> Option<SettledInvite> {
        let entry = invites.remove(token)?;

        self.presence.release(&entry.host).await;
        if outcome.releases_guest() {
            self.presence.release(&entry.guest).await;
        }
        // Open the handoff before waking the host so its port report finds it.
        if outcome == InviteOutcome::Accepted {
            self.handoffs
                .open(token.clone(), &entry.host, &entry.guest)
                .await;
        }
        if entry.resolver.send(outcome).is_err() {
            debug!(token = %token, "host stopped waiting before resolution");
        }

        info!(
            token = %token,
            host = %entry.host,
            guest = %entry.guest,
            outcome = %outcome,
            status = ?outcome.status(),
            "invite resolved"
        );
        self.events.record(LobbyEvent::InviteResolved {
            token: token.clone(),
            host: entry.host.clone(),
            guest: entry.guest.clone(),
            outcome,
        });
        Some(SettledInvite {
            host: entry.host,
            guest: entry.guest,
        })
    }

    async fn close_for_guest(&self, guest: &str, token: &InviteToken, outcome: InviteOutcome) {
        self.registry
            .notify(
                guest,
                ServerMessage::InviteClosed {
                    token: token.clone(),
                    outcome,
                },
            )
            .await;
    }
}

struct SettledInvite {
    host: String,
    guest: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEventLog;
    use crate::registry::SessionHandle;
    use crate::store::MemoryStore;
    use lobby_core::Notification;
    use tokio::sync::mpsc;

    const TIMEOUT: Duration = Duration::from_secs(15);

    struct Fixture {
        presence: Arc<PresenceTable>,
        registry: Arc<SessionRegistry>,
        handoffs: Arc<HandoffCoordinator>,
        events: Arc<MemoryEventLog>,
        broker: Arc<InviteBroker>,
    }

    async fn fixture() -> Fixture {
        let events = Arc::new(MemoryEventLog::new());
        let presence =
            Arc::new(PresenceTable::load(Arc::new(MemoryStore::new()), events.clone()).unwrap());
        let registry = Arc::new(SessionRegistry::new());
        let handoffs = Arc::new(HandoffCoordinator::new(
            presence.clone(),
            registry.clone(),
            events.clone(),
            Duration::from_secs(30),
        ));
        let broker = Arc::new(InviteBroker::new(
            presence.clone(),
            registry.clone(),
            handoffs.clone(),
            events.clone(),
            TIMEOUT,
        ));
        Fixture {
            presence,
            registry,
            handoffs,
            events,
            broker,
        }
    }

    impl Fixture {
        async fn connect(&self, user: &str) -> mpsc::Receiver<ServerMessage> {
            let addr = "127.0.0.1:6000".parse().unwrap();
            self.presence.register(user, "pw").await.unwrap();
            self.presence.login(user, "pw", addr).await.unwrap();
            let (tx, rx) = mpsc::channel(16);
            self.registry.put(user, SessionHandle::new(0, addr, tx)).await;
            rx
        }

        fn resolutions(&self) -> usize {
            self.events
                .events()
                .iter()
                .filter(|e| matches!(e, LobbyEvent::InviteResolved { .. }))
                .count()
        }
    }

    #[tokio::test]
    async fn accept_resolves_and_opens_handoff() {
        let f = fixture().await;
        let _a = f.connect("alice").await;
        let mut bob = f.connect("bob").await;

        let pending = f.broker.initiate("alice", "bob").await.unwrap();
        let token = pending.token.clone();
        match bob.recv().await {
            Some(ServerMessage::Invitation { token: t, while_playing, message, .. }) => {
                assert_eq!(t, token);
                assert!(!while_playing);
                assert!(message.contains("invited you to a game"));
            }
            other => panic!("expected invitation, got {other:?}"),
        }

        let broker = f.broker.clone();
        let waiter = tokio::spawn(async move { broker.wait(pending).await });
        let outcome = f.broker.answer("bob", Some(&token), Answer::Accept).await.unwrap();
        assert_eq!(outcome, InviteOutcome::Accepted);
        assert_eq!(waiter.await.unwrap(), InviteOutcome::Accepted);

        assert_eq!(f.presence.notification("alice").await, Some(Notification::Available));
        assert_eq!(f.presence.notification("bob").await, Some(Notification::Available));
        assert!(f.handoffs.involves("bob").await);
        assert_eq!(f.broker.pending_count().await, 0);
    }

    #[tokio::test]
    async fn concurrent_invites_to_one_guest() {
        let f = fixture().await;
        let _a = f.connect("alice").await;
        let _c = f.connect("carol").await;
        let _b = f.connect("bob").await;

        let (first, second) = tokio::join!(
            f.broker.initiate("alice", "bob"),
            f.broker.initiate("carol", "bob")
        );
        let results = [first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(LobbyError::Busy))));
        assert_eq!(f.broker.pending_count().await, 1);
    }

    #[tokio::test]
    async fn self_invite_touches_nothing() {
        let f = fixture().await;
        let _a = f.connect("alice").await;
        let err = f.broker.initiate("alice", "alice").await.unwrap_err();
        assert_eq!(err.to_string(), "cannot invite self");
        assert_eq!(f.broker.pending_count().await, 0);
        assert_eq!(f.presence.notification("alice").await, Some(Notification::Available));
    }

    #[tokio::test]
    async fn host_with_open_handoff_cannot_invite_again() {
        let f = fixture().await;
        let _a = f.connect("alice").await;
        let _b = f.connect("bob").await;
        let _c = f.connect("carol").await;
        f.handoffs.open("t1".into(), "alice", "bob").await;

        // Still ONLINE until the port report, but committed to bob.
        assert!(matches!(
            f.broker.initiate("alice", "carol").await,
            Err(LobbyError::Conflict(_))
        ));
        assert_eq!(f.broker.pending_count().await, 0);
        assert_eq!(f.presence.notification("carol").await, Some(Notification::Available));
    }

    #[tokio::test(start_paused = true)]
    async fn online_guest_times_out_and_stays_busy() {
        let f = fixture().await;
        let _a = f.connect("alice").await;
        let mut bob = f.connect("bob").await;

        let pending = f.broker.initiate("alice", "bob").await.unwrap();
        let started = Instant::now();
        let outcome = f.broker.wait(pending).await;
        assert_eq!(outcome, InviteOutcome::Timeout);
        assert!(started.elapsed() >= TIMEOUT);

        assert_eq!(f.presence.notification("alice").await, Some(Notification::Available));
        assert_eq!(f.presence.notification("bob").await, Some(Notification::Busy));
        let _invitation = bob.recv().await;
        assert!(matches!(
            bob.recv().await,
            Some(ServerMessage::InviteClosed { outcome: InviteOutcome::Timeout, .. })
        ));

        // Re-arming lets the next invite through.
        f.presence.set_available("bob").await.unwrap();
        assert!(f.broker.initiate("alice", "bob").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn playing_guest_ignores_without_penalty() {
        let f = fixture().await;
        let _a = f.connect("alice").await;
        let mut bob = f.connect("bob").await;
        let _c = f.connect("carol").await;
        f.presence.start_match("bob", "carol").await.unwrap();

        let pending = f.broker.initiate("alice", "bob").await.unwrap();
        assert!(matches!(
            bob.recv().await,
            Some(ServerMessage::Invitation { while_playing: true, .. })
        ));
        assert_eq!(f.broker.wait(pending).await, InviteOutcome::Ignored);
        assert_eq!(f.presence.notification("bob").await, Some(Notification::Available));
    }

    #[tokio::test(start_paused = true)]
    async fn resolution_is_exactly_once() {
        let f = fixture().await;
        let _a = f.connect("alice").await;
        let _b = f.connect("bob").await;

        let pending = f.broker.initiate("alice", "bob").await.unwrap();
        let token = pending.token.clone();
        assert_eq!(f.broker.wait(pending).await, InviteOutcome::Timeout);

        // A late answer and a second expiry both find nothing to settle.
        assert!(matches!(
            f.broker.answer("bob", Some(&token), Answer::Accept).await,
            Err(LobbyError::NotFound(_))
        ));
        assert_eq!(f.broker.expire(&token).await, None);
        assert_eq!(f.resolutions(), 1);
    }

    #[tokio::test]
    async fn answer_racing_expiry_settles_once() {
        let f = fixture().await;
        let _a = f.connect("alice").await;
        let _b = f.connect("bob").await;

        let pending = f.broker.initiate("alice", "bob").await.unwrap();
        let token = pending.token.clone();
        let (answered, expired) = tokio::join!(
            f.broker.answer("bob", Some(&token), Answer::Decline),
            f.broker.expire(&token)
        );
        assert!(answered.is_ok() != expired.is_some());
        assert_eq!(f.resolutions(), 1);
    }

    #[tokio::test]
    async fn garbled_answer_is_unexpected_response() {
        let f = fixture().await;
        let _a = f.connect("alice").await;
        let _b = f.connect("bob").await;

        let pending = f.broker.initiate("alice", "bob").await.unwrap();
        f.broker
            .answer("bob", None, Answer::Garbled("maybe later".into()))
            .await
            .unwrap();
        let outcome = f.broker.wait(pending).await;
        assert_eq!(outcome, InviteOutcome::UnexpectedResponse);
        assert_eq!(outcome.status(), lobby_core::InviteStatus::Declined);
    }

    #[tokio::test]
    async fn guest_disconnect_aborts_and_releases_host() {
        let f = fixture().await;
        let _a = f.connect("alice").await;
        let _b = f.connect("bob").await;

        let pending = f.broker.initiate("alice", "bob").await.unwrap();
        assert_eq!(f.broker.abort_for("bob").await, 1);
        assert_eq!(f.broker.wait(pending).await, InviteOutcome::Aborted);
        assert_eq!(f.presence.notification("alice").await, Some(Notification::Available));
        assert!(!f.broker.involves("alice").await);
    }

    #[tokio::test]
    async fn guest_mid_handoff_is_busy() {
        let f = fixture().await;
        let _a = f.connect("alice").await;
        let _b = f.connect("bob").await;
        let _c = f.connect("carol").await;

        let pending = f.broker.initiate("alice", "bob").await.unwrap();
        f.broker.answer("bob", None, Answer::Accept).await.unwrap();
        assert_eq!(f.broker.wait(pending).await, InviteOutcome::Accepted);

        assert!(matches!(
            f.broker.initiate("carol", "bob").await,
            Err(LobbyError::Busy)
        ));
    }
}
