//! Structured lobby event log.
//!
//! Every presence transition and invite/handoff milestone is recorded as a
//! timestamped event. `FileEventLog` appends newline-delimited JSON from a
//! background task so recording never blocks a connection handler.

use lobby_core::{InviteOutcome, InviteToken, Status};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
#[cfg(test)]
use std::sync::Mutex;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::store::now_ms;

/// Events emitted by the lobby.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum LobbyEvent {
    Registered { user: String },
    LoggedIn { user: String, addr: String },
    LoggedOut { user: String },
    StatusChanged { user: String, from: Status, to: Status },
    InviteCreated { token: InviteToken, host: String, guest: String },
    InviteResolved { token: InviteToken, host: String, guest: String, outcome: InviteOutcome },
    HandoffStarted { token: InviteToken, host: String, guest: String, port: u16 },
    HandoffCompleted { token: InviteToken, host: String, guest: String },
    HandoffFailed { token: InviteToken, host: String, guest: String, reason: String },
    MatchOver { user: String, opponent: Option<String> },
}

/// A single timestamped entry in the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEntry {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    pub event: LobbyEvent,
}

/// Sink for lobby events. Recording is best-effort and never fails the caller.
pub trait EventSink: Send + Sync {
    fn record(&self, event: LobbyEvent);
}

/// Discards every event.
pub struct NullEventLog;

impl EventSink for NullEventLog {
    fn record(&self, _event: LobbyEvent) {}
}

/// Keeps events in memory, for tests.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryEventLog {
    events: Mutex<Vec<LobbyEvent>>,
}

#[cfg(test)]
impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LobbyEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
impl EventSink for MemoryEventLog {
    fn record(&self, event: LobbyEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Appends events to a JSONL file.
pub struct FileEventLog {
    path: PathBuf,
    tx: mpsc::UnboundedSender<EventEntry>,
}

impl FileEventLog {
    /// Start the writer task. Must be called inside a tokio runtime.
    pub fn spawn(path: PathBuf) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(path.clone(), rx));
        Self { path, tx }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for FileEventLog {
    fn record(&self, event: LobbyEvent) {
        let entry = EventEntry {
            timestamp_ms: now_ms(),
            event,
        };
        if self.tx.send(entry).is_err() {
            debug!(path = %self.path.display(), "event writer gone, dropping event");
        }
    }
}

async fn write_loop(path: PathBuf, mut rx: mpsc::UnboundedReceiver<EventEntry>) {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                error!(path = %parent.display(), error = %e, "could not create event log dir");
            }
        }
    }

    while let Some(entry) = rx.recv().await {
        match serde_json::to_string(&entry) {
            Ok(mut line) => {
                line.push('\n');
                if let Err(e) = append_line(&path, &line).await {
                    error!(path = %path.display(), error = %e, "failed to write event");
                }
            }
            Err(e) => error!(error = %e, "failed to serialize event"),
        }
    }
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// Load an event log from disk, skipping malformed lines.
#[cfg(test)]
pub async fn load_events(path: &Path) -> std::io::Result<Vec<EventEntry>> {
    let content = tokio::fs::read_to_string(path).await?;
    let mut entries = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<EventEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => error!(error = %e, "skipping malformed event line"),
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn file_log_appends_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("events.jsonl");
        let log = FileEventLog::spawn(path.clone());
        log.record(LobbyEvent::Registered { user: "alice".into() });
        log.record(LobbyEvent::StatusChanged {
            user: "alice".into(),
            from: Status::Offline,
            to: Status::Online,
        });

        let mut entries = Vec::new();
        for _ in 0..50 {
            if let Ok(loaded) = load_events(&path).await {
                if loaded.len() == 2 {
                    entries = loaded;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0].event,
            LobbyEvent::Registered { user: "alice".into() }
        );
    }

    #[test]
    fn memory_log_keeps_order() {
        let log = MemoryEventLog::new();
        log.record(LobbyEvent::LoggedOut { user: "a".into() });
        log.record(LobbyEvent::LoggedOut { user: "b".into() });
        assert_eq!(log.events().len(), 2);
    }
}
