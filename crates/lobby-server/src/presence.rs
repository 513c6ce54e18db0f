//! Presence state machine.
//!
//! Status: OFFLINE → ONLINE (login) → PLAYING (match start) → ONLINE
//! (match end) → OFFLINE (logout/disconnect). The notification flag is
//! independent: BUSY from invite creation until that invite resolves.
//!
//! All users live behind one lock. Contention is low and invite creation
//! needs to inspect and flip two users atomically anyway.

use crate::events::{EventSink, LobbyEvent};
use crate::store::{UserRecord, UserStore};
use lobby_core::{LobbyError, LobbyResult, Notification, Status};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

const MAX_USERNAME_LEN: usize = 32;

struct UserEntry {
    record: UserRecord,
    notification: Notification,
    last_address: Option<SocketAddr>,
}

/// Guards passed for a new invite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    /// Guest status when the invite was created.
    pub guest_status: Status,
}

/// Per-user presence, backed by the user store.
pub struct PresenceTable {
    users: Mutex<HashMap<String, UserEntry>>,
    store: Arc<dyn UserStore>,
    events: Arc<dyn EventSink>,
}

impl PresenceTable {
    /// Load users from the store. Persisted statuses are reset to OFFLINE,
    /// since no connection survives a restart.
    pub fn load(store: Arc<dyn UserStore>, events: Arc<dyn EventSink>) -> LobbyResult<Self> {
        let records = store.load()?;
        let mut stale = 0usize;
        let users: HashMap<String, UserEntry> = records
            .into_iter()
            .map(|(name, mut record)| {
                if record.status != Status::Offline {
                    stale += 1;
                    record.status = Status::Offline;
                }
                (
                    name,
                    UserEntry {
                        record,
                        notification: Notification::Available,
                        last_address: None,
                    },
                )
            })
            .collect();

        let table = Self {
            users: Mutex::new(HashMap::new()),
            store,
            events,
        };
        if stale > 0 {
            info!(count = stale, "reset stale statuses to OFFLINE");
            table.persist(&users);
        }
        info!(count = users.len(), "loaded registered users");
        Ok(Self {
            users: Mutex::new(users),
            ..table
        })
    }

    /// Register a new user.
    pub async fn register(&self, username: &str, password: &str) -> LobbyResult<()> {
        validate_username(username)?;
        if password.is_empty() {
            return Err(LobbyError::InvalidMessage("password must not be empty".into()));
        }
        let mut users = self.users.lock().await;
        if users.contains_key(username) {
            return Err(LobbyError::Conflict("username already taken".into()));
        }
        users.insert(
            username.to_string(),
            UserEntry {
                record: UserRecord::new(password),
                notification: Notification::Available,
                last_address: None,
            },
        );
        self.persist(&users);
        drop(users);

        info!(user = %username, "user registered");
        self.events.record(LobbyEvent::Registered {
            user: username.to_string(),
        });
        Ok(())
    }

    /// OFFLINE → ONLINE. Rejects a second login while the user is connected.
    pub async fn login(&self, username: &str, password: &str, addr: SocketAddr) -> LobbyResult<()> {
        let mut users = self.users.lock().await;
        let entry = users
            .get_mut(username)
            .ok_or_else(|| LobbyError::NotFound(format!("user {username}")))?;
        if !entry.record.verify(password) {
            return Err(LobbyError::AuthFailed("wrong password".into()));
        }
        if entry.record.status != Status::Offline {
            return Err(LobbyError::Conflict("user already logged in".into()));
        }
        entry.notification = Notification::Available;
        entry.last_address = Some(addr);
        self.transition(&mut users, username, Status::Online);
        drop(users);

        self.events.record(LobbyEvent::LoggedIn {
            user: username.to_string(),
            addr: addr.to_string(),
        });
        Ok(())
    }

    /// Any → OFFLINE. Idempotent; returns the status the user had.
    pub async fn logout(&self, username: &str) -> Status {
        let mut users = self.users.lock().await;
        let previous = self.transition(&mut users, username, Status::Offline);
        if let Some(entry) = users.get_mut(username) {
            entry.notification = Notification::Available;
        }
        drop(users);

        if previous.is_some_and(Status::is_connected) {
            self.events.record(LobbyEvent::LoggedOut {
                user: username.to_string(),
            });
        }
        previous.unwrap_or(Status::Offline)
    }

    /// Both users → PLAYING. Both must be connected.
    pub async fn start_match(&self, a: &str, b: &str) -> LobbyResult<()> {
        let mut users = self.users.lock().await;
        for name in [a, b] {
            match users.get(name).map(|e| e.record.status) {
                Some(status) if status.is_connected() => {}
                Some(_) => return Err(LobbyError::Offline),
                None => return Err(LobbyError::NotFound(format!("player {name}"))),
            }
        }
        self.transition(&mut users, a, Status::Playing);
        self.transition(&mut users, b, Status::Playing);
        Ok(())
    }

    /// PLAYING → ONLINE; anything else is left alone. Returns whether the
    /// user changed state.
    pub async fn end_match(&self, username: &str) -> bool {
        let mut users = self.users.lock().await;
        if users.get(username).map(|e| e.record.status) != Some(Status::Playing) {
            return false;
        }
        self.transition(&mut users, username, Status::Online);
        true
    }

    /// Evaluate the invite guards in order and, if they all pass, mark both
    /// users BUSY in the same critical section.
    ///
    /// `in_handoff` is true when the guest is mid-handoff for another
    /// invite; such a guest is reported busy. The broker turns away a host
    /// with an open handoff before getting here.
    pub async fn reserve_invite(
        &self,
        host: &str,
        guest: &str,
        in_handoff: bool,
    ) -> LobbyResult<Reservation> {
        if host == guest {
            return Err(LobbyError::Conflict("cannot invite self".into()));
        }
        let mut users = self.users.lock().await;
        let (host_status, host_notification) = match users.get(host) {
            Some(e) => (e.record.status, e.notification),
            None => return Err(LobbyError::NotFound(format!("player {host}"))),
        };
        let (guest_status, guest_notification) = match users.get(guest) {
            Some(e) => (e.record.status, e.notification),
            None => return Err(LobbyError::NotFound(format!("player {guest}"))),
        };
        if host_status != Status::Online || !guest_status.is_invitable() {
            return Err(LobbyError::Offline);
        }
        if guest_notification == Notification::Busy || in_handoff {
            return Err(LobbyError::Busy);
        }
        if host_notification == Notification::Busy {
            return Err(LobbyError::Conflict(
                "answer your pending invite first, or send AVAILABLE".into(),
            ));
        }

        for name in [host, guest] {
            if let Some(entry) = users.get_mut(name) {
                entry.notification = Notification::Busy;
            }
        }
        debug!(host = %host, guest = %guest, "notification flags reserved");
        Ok(Reservation { guest_status })
    }

    /// Notification → AVAILABLE after an invite resolves.
    pub async fn release(&self, username: &str) {
        let mut users = self.users.lock().await;
        if let Some(entry) = users.get_mut(username) {
            entry.notification = Notification::Available;
        }
    }

    /// Explicit re-arm (`AVAILABLE <user>`), e.g. after a timed-out invite.
    pub async fn set_available(&self, username: &str) -> LobbyResult<()> {
        let mut users = self.users.lock().await;
        let entry = users
            .get_mut(username)
            .ok_or_else(|| LobbyError::NotFound(format!("player {username}")))?;
        if !entry.record.status.is_connected() {
            return Err(LobbyError::Offline);
        }
        entry.notification = Notification::Available;
        Ok(())
    }

    /// Users in `status`, sorted, optionally excluding one name.
    pub async fn list(&self, status: Status, exclude: Option<&str>) -> Vec<String> {
        let users = self.users.lock().await;
        let mut names: Vec<String> = users
            .iter()
            .filter(|(name, e)| e.record.status == status && Some(name.as_str()) != exclude)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub async fn status(&self, username: &str) -> Option<Status> {
        self.users.lock().await.get(username).map(|e| e.record.status)
    }

    #[cfg(test)]
    pub async fn notification(&self, username: &str) -> Option<Notification> {
        self.users.lock().await.get(username).map(|e| e.notification)
    }

    /// Address the user logged in from.
    pub async fn last_address(&self, username: &str) -> Option<SocketAddr> {
        self.users.lock().await.get(username).and_then(|e| e.last_address)
    }

    /// Apply a status change, persist and emit it. Returns the previous
    /// status, or `None` for an unknown user.
    fn transition(
        &self,
        users: &mut HashMap<String, UserEntry>,
        username: &str,
        to: Status,
    ) -> Option<Status> {
        let entry = users.get_mut(username)?;
        let from = entry.record.status;
        if from == to {
            return Some(from);
        }
        entry.record.status = to;
        self.persist(users);
        info!(user = %username, from = %from, to = %to, "status changed");
        self.events.record(LobbyEvent::StatusChanged {
            user: username.to_string(),
            from,
            to,
        });
        Some(from)
    }

    /// Hand a snapshot of every record to the store. Runs under the table
    /// lock so that snapshots reach the store in order; the store writes
    /// them off the runtime. Failures are logged only.
    fn persist(&self, users: &HashMap<String, UserEntry>) {
        let records: HashMap<String, UserRecord> = users
            .iter()
            .map(|(name, e)| (name.clone(), e.record.clone()))
            .collect();
        if let Err(e) = self.store.save(&records) {
            error!(error = %e, "failed to persist users");
        }
    }
}

fn validate_username(username: &str) -> LobbyResult<()> {
    let valid = !username.is_empty()
        && username.len() <= MAX_USERNAME_LEN
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(LobbyError::InvalidMessage(format!(
            "username must be 1-{MAX_USERNAME_LEN} characters of [A-Za-z0-9_-]"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEventLog;
    use crate::store::MemoryStore;

    fn addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    async fn table_with(users: &[&str]) -> (PresenceTable, Arc<MemoryStore>, Arc<MemoryEventLog>) {
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(MemoryEventLog::new());
        let table = PresenceTable::load(store.clone(), events.clone()).unwrap();
        for user in users {
            table.register(user, "pw").await.unwrap();
        }
        (table, store, events)
    }

    #[tokio::test]
    async fn login_lifecycle() {
        let (table, store, _) = table_with(&["alice"]).await;
        table.login("alice", "pw", addr()).await.unwrap();
        assert_eq!(table.status("alice").await, Some(Status::Online));
        assert_eq!(store.record("alice").unwrap().status, Status::Online);
        assert_eq!(table.last_address("alice").await, Some(addr()));

        table.start_match("alice", "alice").await.unwrap();
        assert_eq!(table.status("alice").await, Some(Status::Playing));
        assert!(table.end_match("alice").await);
        assert!(!table.end_match("alice").await);

        assert_eq!(table.logout("alice").await, Status::Online);
        assert_eq!(store.record("alice").unwrap().status, Status::Offline);
    }

    #[tokio::test]
    async fn login_rejections() {
        let (table, _, _) = table_with(&["alice"]).await;
        assert!(matches!(
            table.login("bob", "pw", addr()).await,
            Err(LobbyError::NotFound(_))
        ));
        assert!(matches!(
            table.login("alice", "nope", addr()).await,
            Err(LobbyError::AuthFailed(_))
        ));
        table.login("alice", "pw", addr()).await.unwrap();
        assert!(matches!(
            table.login("alice", "pw", addr()).await,
            Err(LobbyError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn register_validation() {
        let (table, _, events) = table_with(&["alice"]).await;
        assert!(matches!(
            table.register("alice", "x").await,
            Err(LobbyError::Conflict(_))
        ));
        assert!(table.register("bad name", "x").await.is_err());
        assert!(table.register("ok_name", "").await.is_err());
        assert!(events
            .events()
            .contains(&LobbyEvent::Registered { user: "alice".into() }));
    }

    #[tokio::test]
    async fn reserve_invite_guard_order() {
        let (table, _, _) = table_with(&["alice", "bob", "carol"]).await;

        // Self-invite wins over every other guard, even for unknown users.
        assert!(matches!(
            table.reserve_invite("ghost", "ghost", false).await,
            Err(LobbyError::Conflict(ref m)) if m == "cannot invite self"
        ));
        assert!(matches!(
            table.reserve_invite("alice", "ghost", false).await,
            Err(LobbyError::NotFound(_))
        ));
        assert!(matches!(
            table.reserve_invite("alice", "bob", false).await,
            Err(LobbyError::Offline)
        ));

        table.login("alice", "pw", addr()).await.unwrap();
        table.login("bob", "pw", addr()).await.unwrap();
        table.login("carol", "pw", addr()).await.unwrap();

        let reservation = table.reserve_invite("alice", "bob", false).await.unwrap();
        assert_eq!(reservation.guest_status, Status::Online);
        assert_eq!(table.notification("alice").await, Some(Notification::Busy));
        assert_eq!(table.notification("bob").await, Some(Notification::Busy));

        // Bob is answering alice; carol's invite must bounce without mutation.
        assert!(matches!(
            table.reserve_invite("carol", "bob", false).await,
            Err(LobbyError::Busy)
        ));
        assert_eq!(table.notification("carol").await, Some(Notification::Available));
    }

    #[tokio::test]
    async fn playing_guest_is_invitable_but_playing_host_is_not() {
        let (table, _, _) = table_with(&["alice", "bob"]).await;
        table.login("alice", "pw", addr()).await.unwrap();
        table.login("bob", "pw", addr()).await.unwrap();
        table.start_match("bob", "bob").await.unwrap();

        let reservation = table.reserve_invite("alice", "bob", false).await.unwrap();
        assert_eq!(reservation.guest_status, Status::Playing);
        table.release("alice").await;
        table.release("bob").await;

        assert!(matches!(
            table.reserve_invite("bob", "alice", false).await,
            Err(LobbyError::Offline)
        ));
    }

    #[tokio::test]
    async fn handoff_in_progress_reads_as_busy() {
        let (table, _, _) = table_with(&["alice", "bob"]).await;
        table.login("alice", "pw", addr()).await.unwrap();
        table.login("bob", "pw", addr()).await.unwrap();
        assert!(matches!(
            table.reserve_invite("alice", "bob", true).await,
            Err(LobbyError::Busy)
        ));
    }

    #[tokio::test]
    async fn restart_resets_stale_status() {
        let store = Arc::new(MemoryStore::new());
        let mut users = HashMap::new();
        let mut record = UserRecord::new("pw");
        record.status = Status::Playing;
        users.insert("alice".to_string(), record);
        store.save(&users).unwrap();

        let table = PresenceTable::load(store.clone(), Arc::new(MemoryEventLog::new())).unwrap();
        assert_eq!(table.status("alice").await, Some(Status::Offline));
        assert_eq!(store.record("alice").unwrap().status, Status::Offline);
    }

    #[tokio::test]
    async fn set_available_requires_connection() {
        let (table, _, _) = table_with(&["alice"]).await;
        assert!(matches!(
            table.set_available("alice").await,
            Err(LobbyError::Offline)
        ));
        table.login("alice", "pw", addr()).await.unwrap();
        table.set_available("alice").await.unwrap();
    }
}
