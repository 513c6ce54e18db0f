//! User store: credential records and last-known presence.
//!
//! The lobby keeps the full user map in memory and hands a snapshot to the
//! store on every change. `JsonFileStore` queues snapshots to a writer task,
//! which keeps only the newest and writes it on the blocking pool through a
//! temp file + rename so a crash never leaves a half-written file.

use lobby_core::{LobbyError, LobbyResult, Status};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
#[cfg(test)]
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

/// A registered user as persisted by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Hex-encoded SHA-256 of `salt || password`.
    pub password_hash: String,
    /// Hex-encoded random salt.
    pub salt: String,
    /// Last persisted presence status.
    #[serde(default)]
    pub status: Status,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub registered_at_ms: u64,
}

impl UserRecord {
    /// Create a record for a new user with a fresh salt.
    pub fn new(password: &str) -> Self {
        use rand::Rng;
        let salt: [u8; 16] = rand::thread_rng().gen();
        let salt = hex::encode(salt);
        Self {
            password_hash: hash_password(password, &salt),
            salt,
            status: Status::Offline,
            registered_at_ms: now_ms(),
        }
    }

    /// Check a login password against the stored hash.
    pub fn verify(&self, password: &str) -> bool {
        hash_password(password, &self.salt) == self.password_hash
    }
}

/// Salted SHA-256 of a password, hex-encoded.
pub fn hash_password(password: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Persistence backend for user records.
pub trait UserStore: Send + Sync {
    /// Load every user record.
    fn load(&self) -> LobbyResult<HashMap<String, UserRecord>>;

    /// Replace the persisted records with `users`. Must not block: it is
    /// called with the presence lock held.
    fn save(&self, users: &HashMap<String, UserRecord>) -> LobbyResult<()>;
}

enum WriteOp {
    Snapshot(HashMap<String, UserRecord>),
    Flush(oneshot::Sender<()>),
}

/// Users persisted as a pretty-printed JSON object keyed by username.
pub struct JsonFileStore {
    path: PathBuf,
    tx: mpsc::UnboundedSender<WriteOp>,
}

impl JsonFileStore {
    /// Start the writer task. Must be called inside a tokio runtime.
    pub fn spawn(path: PathBuf) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(path.clone(), rx));
        Self { path, tx }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait until every snapshot queued so far is on disk.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(WriteOp::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

async fn write_loop(path: PathBuf, mut rx: mpsc::UnboundedReceiver<WriteOp>) {
    while let Some(op) = rx.recv().await {
        let mut latest = None;
        let mut waiters = Vec::new();
        let mut next = Some(op);
        // Older snapshots are superseded by anything queued behind them.
        while let Some(op) = next.take().or_else(|| rx.try_recv().ok()) {
            match op {
                WriteOp::Snapshot(users) => latest = Some(users),
                WriteOp::Flush(done) => waiters.push(done),
            }
        }

        if let Some(users) = latest {
            let target = path.clone();
            match tokio::task::spawn_blocking(move || write_snapshot(&target, &users)).await {
                Ok(Ok(())) => debug!(path = %path.display(), "users saved"),
                Ok(Err(e)) => error!(path = %path.display(), error = %e, "failed to persist users"),
                Err(e) => error!(error = %e, "user store writer panicked"),
            }
        }
        for done in waiters {
            let _ = done.send(());
        }
    }
}

fn write_snapshot(path: &Path, users: &HashMap<String, UserRecord>) -> LobbyResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let content = serde_json::to_string_pretty(users)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

impl UserStore for JsonFileStore {
    fn load(&self) -> LobbyResult<HashMap<String, UserRecord>> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "user store not found, starting empty");
            return Ok(HashMap::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(HashMap::new());
        }
        let users: HashMap<String, UserRecord> = serde_json::from_str(&content).map_err(|e| {
            LobbyError::Other(format!(
                "user store {} is corrupt: {e}",
                self.path.display()
            ))
        })?;
        debug!(path = %self.path.display(), count = users.len(), "loaded users");
        Ok(users)
    }

    fn save(&self, users: &HashMap<String, UserRecord>) -> LobbyResult<()> {
        self.tx
            .send(WriteOp::Snapshot(users.clone()))
            .map_err(|_| LobbyError::Other("user store writer stopped".into()))
    }
}

/// In-memory store, for tests.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryStore {
    users: Mutex<HashMap<String, UserRecord>>,
}

#[cfg(test)]
impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current persisted copy of one user's record.
    pub fn record(&self, username: &str) -> Option<UserRecord> {
        self.users
            .lock()
            .ok()
            .and_then(|users| users.get(username).cloned())
    }
}

#[cfg(test)]
impl UserStore for MemoryStore {
    fn load(&self) -> LobbyResult<HashMap<String, UserRecord>> {
        self.users
            .lock()
            .map(|users| users.clone())
            .map_err(|_| LobbyError::Other("memory store poisoned".into()))
    }

    fn save(&self, users: &HashMap<String, UserRecord>) -> LobbyResult<()> {
        let mut guard = self
            .users
            .lock()
            .map_err(|_| LobbyError::Other("memory store poisoned".into()))?;
        *guard = users.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_verification() {
        let record = UserRecord::new("hunter2");
        assert!(record.verify("hunter2"));
        assert!(!record.verify("hunter3"));
        assert_eq!(record.status, Status::Offline);
    }

    #[test]
    fn salts_differ_between_records() {
        let a = UserRecord::new("same");
        let b = UserRecord::new("same");
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.password_hash, b.password_hash);
    }

    #[tokio::test]
    async fn json_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::spawn(dir.path().join("users.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[tokio::test]
    async fn json_store_persists_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("users.json");
        let store = JsonFileStore::spawn(path.clone());

        let mut users = HashMap::new();
        let mut record = UserRecord::new("pw");
        record.status = Status::Playing;
        users.insert("alice".to_string(), record.clone());
        store.save(&users).unwrap();
        store.flush().await;

        let reloaded = JsonFileStore::spawn(path).load().unwrap();
        assert_eq!(reloaded.get("alice"), Some(&record));
    }

    #[tokio::test]
    async fn json_store_keeps_latest_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        let store = JsonFileStore::spawn(path.clone());

        let mut users = HashMap::new();
        for name in ["alice", "bob", "carol"] {
            users.insert(name.to_string(), UserRecord::new("pw"));
            store.save(&users).unwrap();
        }
        store.flush().await;

        let reloaded = store.load().unwrap();
        assert_eq!(reloaded.len(), 3);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn json_store_reports_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(JsonFileStore::spawn(path).load().is_err());
    }
}
