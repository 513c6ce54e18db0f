//! Session registry: logged-in username → live connection handle.
//!
//! The connection handler owns its socket; the registry only holds a clone
//! of the handler's outbound sender, so dropping an entry never closes a
//! connection and a stale entry can at worst fail a send.

use lobby_core::ServerMessage;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

/// Non-owning handle to a connection's outbound message queue.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    /// Server-assigned connection ID.
    pub conn_id: u64,
    /// Remote address of the lobby connection.
    pub remote: SocketAddr,
    tx: mpsc::Sender<ServerMessage>,
}

impl SessionHandle {
    pub fn new(conn_id: u64, remote: SocketAddr, tx: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            conn_id,
            remote,
            tx,
        }
    }

    /// Queue a message without waiting. Returns false if the connection is
    /// gone or its queue is full.
    pub fn push(&self, msg: ServerMessage) -> bool {
        self.tx.try_send(msg).is_ok()
    }
}

/// Registry of logged-in sessions.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the handle for `username`. Last writer wins.
    pub async fn put(&self, username: &str, handle: SessionHandle) {
        let mut sessions = self.sessions.write().await;
        if let Some(previous) = sessions.insert(username.to_string(), handle) {
            warn!(user = %username, conn_id = previous.conn_id, "replaced existing session handle");
        }
    }

    /// Remove the handle for `username` regardless of owner.
    #[cfg(test)]
    pub async fn remove(&self, username: &str) -> Option<SessionHandle> {
        self.sessions.write().await.remove(username)
    }

    /// Remove the handle only if it was installed by connection `conn_id`.
    pub async fn remove_if(&self, username: &str, conn_id: u64) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(username) {
            Some(handle) if handle.conn_id == conn_id => {
                sessions.remove(username);
                debug!(user = %username, conn_id, "session unregistered");
                true
            }
            _ => false,
        }
    }

    /// Look up a live connection. `None` means "not connected".
    pub async fn get(&self, username: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(username).cloned()
    }

    /// Push a message to a user's connection, if any.
    pub async fn notify(&self, username: &str, msg: ServerMessage) -> bool {
        match self.get(username).await {
            Some(handle) => {
                let delivered = handle.push(msg);
                if !delivered {
                    warn!(user = %username, "could not deliver message to session");
                }
                delivered
            }
            None => false,
        }
    }

    /// Number of registered sessions.
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(conn_id: u64) -> (SessionHandle, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(4);
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        (SessionHandle::new(conn_id, addr, tx), rx)
    }

    #[tokio::test]
    async fn put_get_remove() {
        let registry = SessionRegistry::new();
        let (h, _rx) = handle(1);
        registry.put("alice", h).await;
        assert_eq!(registry.get("alice").await.map(|h| h.conn_id), Some(1));
        assert!(registry.get("bob").await.is_none());
        assert!(registry.remove("alice").await.is_some());
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn remove_if_ignores_foreign_connection() {
        let registry = SessionRegistry::new();
        let (old, _rx1) = handle(1);
        let (new, _rx2) = handle(2);
        registry.put("alice", old).await;
        registry.put("alice", new).await;
        assert!(!registry.remove_if("alice", 1).await);
        assert!(registry.remove_if("alice", 2).await);
    }

    #[tokio::test]
    async fn notify_delivers_and_reports_absence() {
        let registry = SessionRegistry::new();
        let (h, mut rx) = handle(7);
        registry.put("bob", h).await;
        assert!(registry.notify("bob", ServerMessage::ok("hi")).await);
        assert_eq!(rx.recv().await, Some(ServerMessage::ok("hi")));

        drop(rx);
        assert!(!registry.notify("bob", ServerMessage::ok("gone")).await);
        assert!(!registry.notify("nobody", ServerMessage::ok("x")).await);
    }
}
