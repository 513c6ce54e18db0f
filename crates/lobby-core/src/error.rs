use crate::messages::ErrorKind;
use thiserror::Error;

/// Errors produced by the lobby protocol layer.
#[derive(Debug, Error)]
pub enum LobbyError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("{0}")]
    Conflict(String),

    #[error("guest is busy with another invite, retry later")]
    Busy,

    #[error("player offline")]
    Offline,

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection lost")]
    ConnectionLost,

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl LobbyError {
    /// Wire classification used when the error is reported to a client.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LobbyError::Codec(_) | LobbyError::InvalidMessage(_) => ErrorKind::Validation,
            LobbyError::Conflict(_) => ErrorKind::Conflict,
            LobbyError::Busy => ErrorKind::Busy,
            LobbyError::Offline => ErrorKind::Offline,
            LobbyError::AuthFailed(_) => ErrorKind::Auth,
            LobbyError::NotFound(_) => ErrorKind::NotFound,
            LobbyError::Timeout => ErrorKind::Timeout,
            LobbyError::Transport(_)
            | LobbyError::ConnectionLost
            | LobbyError::Io(_)
            | LobbyError::Other(_) => ErrorKind::Internal,
        }
    }

    /// Rebuild an error from its wire form (client side).
    pub fn from_wire(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::Validation => LobbyError::InvalidMessage(message),
            ErrorKind::Conflict => LobbyError::Conflict(message),
            ErrorKind::Busy => LobbyError::Busy,
            ErrorKind::Offline => LobbyError::Offline,
            ErrorKind::Auth => LobbyError::AuthFailed(message),
            ErrorKind::NotFound => LobbyError::NotFound(message),
            ErrorKind::Timeout => LobbyError::Timeout,
            ErrorKind::Internal => LobbyError::Other(message),
        }
    }
}

impl From<serde_json::Error> for LobbyError {
    fn from(e: serde_json::Error) -> Self {
        LobbyError::Codec(e.to_string())
    }
}

pub type LobbyResult<T> = Result<T, LobbyError>;
