//! Lobby wire messages.
//!
//! Client → server: one command per line, either whitespace-delimited text
//! (`GAME_INI alice bob`) or a JSON object tagged by `"cmd"`.
//! Server → client: one JSON object per line tagged by `"type"`.

use crate::error::{LobbyError, LobbyResult};
use crate::presence::Status;
use crate::token::InviteToken;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Every command name the server understands, including answer aliases.
pub const COMMAND_NAMES: &[&str] = &[
    "REGISTER",
    "LOGIN",
    "LOGOUT",
    "LIST_USERS_ONLINE",
    "LIST_USERS_PLAYING",
    "GAME_INI",
    "ACCEPT",
    "GAME_ACK",
    "DECLINE",
    "GAME_NEG",
    "SEND_GUEST_CONN_PORT",
    "GAME_START",
    "GAME_OVER",
    "AVAILABLE",
];

/// A command sent by a client on its lobby connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Request {
    Register { user: String, password: String },
    Login { user: String, password: String },
    Logout,
    ListUsersOnline { user: String },
    ListUsersPlaying,
    GameIni { host: String, guest: String },
    Accept { token: Option<InviteToken> },
    Decline { token: Option<InviteToken> },
    SendGuestConnPort { guest: String, port: u16 },
    GameStart { host: String, guest: String },
    GameOver { user: String },
    Available { user: String },
}

impl Request {
    /// Parse one inbound line in either the text or the JSON form.
    pub fn parse(line: &str) -> LobbyResult<Self> {
        let line = line.trim();
        if line.starts_with('{') {
            return serde_json::from_str(line)
                .map_err(|e| LobbyError::InvalidMessage(format!("malformed command: {e}")));
        }

        let mut parts = line.split_whitespace();
        let name = parts
            .next()
            .ok_or_else(|| LobbyError::InvalidMessage("empty command".into()))?;
        let args: Vec<&str> = parts.collect();

        let request = match name {
            "REGISTER" => {
                let [user, password] = expect_args::<2>(&args, "REGISTER <user> <pass>")?;
                Request::Register {
                    user: user.into(),
                    password: password.into(),
                }
            }
            "LOGIN" => {
                let [user, password] = expect_args::<2>(&args, "LOGIN <user> <pass>")?;
                Request::Login {
                    user: user.into(),
                    password: password.into(),
                }
            }
            "LOGOUT" => {
                expect_args::<0>(&args, "LOGOUT")?;
                Request::Logout
            }
            "LIST_USERS_ONLINE" => {
                let [user] = expect_args::<1>(&args, "LIST_USERS_ONLINE <user>")?;
                Request::ListUsersOnline { user: user.into() }
            }
            "LIST_USERS_PLAYING" => {
                expect_args::<0>(&args, "LIST_USERS_PLAYING")?;
                Request::ListUsersPlaying
            }
            "GAME_INI" => {
                let [host, guest] = expect_args::<2>(&args, "GAME_INI <host> <guest>")?;
                Request::GameIni {
                    host: host.into(),
                    guest: guest.into(),
                }
            }
            "ACCEPT" | "GAME_ACK" => Request::Accept {
                token: optional_token(&args, "ACCEPT [token]")?,
            },
            "DECLINE" | "GAME_NEG" => Request::Decline {
                token: optional_token(&args, "DECLINE [token]")?,
            },
            "SEND_GUEST_CONN_PORT" => {
                let [guest, port] = expect_args::<2>(&args, "SEND_GUEST_CONN_PORT <guest> <port>")?;
                let port = port
                    .parse::<u16>()
                    .ok()
                    .filter(|p| *p != 0)
                    .ok_or_else(|| LobbyError::InvalidMessage(format!("invalid port: {port}")))?;
                Request::SendGuestConnPort {
                    guest: guest.into(),
                    port,
                }
            }
            "GAME_START" => {
                let [host, guest] = expect_args::<2>(&args, "GAME_START <host> <guest>")?;
                Request::GameStart {
                    host: host.into(),
                    guest: guest.into(),
                }
            }
            "GAME_OVER" => {
                let [user] = expect_args::<1>(&args, "GAME_OVER <user>")?;
                Request::GameOver { user: user.into() }
            }
            "AVAILABLE" => {
                let [user] = expect_args::<1>(&args, "AVAILABLE <user>")?;
                Request::Available { user: user.into() }
            }
            other => {
                return Err(LobbyError::InvalidMessage(format!("unknown command: {other}")));
            }
        };
        Ok(request)
    }

    /// Command name, for logging (never includes arguments).
    pub fn name(&self) -> &'static str {
        match self {
            Request::Register { .. } => "REGISTER",
            Request::Login { .. } => "LOGIN",
            Request::Logout => "LOGOUT",
            Request::ListUsersOnline { .. } => "LIST_USERS_ONLINE",
            Request::ListUsersPlaying => "LIST_USERS_PLAYING",
            Request::GameIni { .. } => "GAME_INI",
            Request::Accept { .. } => "ACCEPT",
            Request::Decline { .. } => "DECLINE",
            Request::SendGuestConnPort { .. } => "SEND_GUEST_CONN_PORT",
            Request::GameStart { .. } => "GAME_START",
            Request::GameOver { .. } => "GAME_OVER",
            Request::Available { .. } => "AVAILABLE",
        }
    }
}

/// Whether the first word of `line` names a known command.
///
/// Lines that fail this check are garbage rather than misuse of a command.
pub fn is_known_command(line: &str) -> bool {
    let trimmed = line.trim_start();
    if trimmed.starts_with('{') {
        return true;
    }
    trimmed
        .split_whitespace()
        .next()
        .is_some_and(|name| COMMAND_NAMES.contains(&name))
}

fn expect_args<'a, const N: usize>(args: &[&'a str], usage: &str) -> LobbyResult<[&'a str; N]> {
    <[&str; N]>::try_from(args).map_err(|_| LobbyError::InvalidMessage(format!("usage: {usage}")))
}

fn optional_token(args: &[&str], usage: &str) -> LobbyResult<Option<InviteToken>> {
    match args {
        [] => Ok(None),
        [token] => Ok(Some(InviteToken::from(*token))),
        _ => Err(LobbyError::InvalidMessage(format!("usage: {usage}"))),
    }
}

/// Wire classification of a rejected command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed command or missing arguments.
    Validation,
    /// Duplicate username, already logged in, self-invite.
    Conflict,
    /// Invite target is still answering another invite.
    Busy,
    Offline,
    Auth,
    NotFound,
    Timeout,
    Internal,
}

/// Lifecycle state of an invite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InviteStatus {
    Pending,
    Accepted,
    Declined,
    Timeout,
    Ignored,
}

/// Terminal result of an invite as reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InviteOutcome {
    Accepted,
    Declined,
    /// Guest was online and never answered.
    Timeout,
    /// Guest was mid-match and let the invite lapse.
    Ignored,
    /// Guest answered with something that was not an answer.
    UnexpectedResponse,
    /// Host or guest disconnected while the invite was pending.
    Aborted,
}

impl InviteOutcome {
    /// The invite status this outcome settles on.
    pub fn status(self) -> InviteStatus {
        match self {
            InviteOutcome::Accepted => InviteStatus::Accepted,
            InviteOutcome::Declined
            | InviteOutcome::UnexpectedResponse
            | InviteOutcome::Aborted => InviteStatus::Declined,
            InviteOutcome::Timeout => InviteStatus::Timeout,
            InviteOutcome::Ignored => InviteStatus::Ignored,
        }
    }

    /// Whether the guest's notification flag goes back to AVAILABLE.
    ///
    /// A timed-out guest stays BUSY until it re-arms itself with `AVAILABLE`.
    pub fn releases_guest(self) -> bool {
        !matches!(self, InviteOutcome::Timeout)
    }
}

impl fmt::Display for InviteOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted => write!(f, "ACCEPTED"),
            Self::Declined => write!(f, "DECLINED"),
            Self::Timeout => write!(f, "TIMEOUT"),
            Self::Ignored => write!(f, "IGNORED"),
            Self::UnexpectedResponse => write!(f, "UNEXPECTED RESPONSE"),
            Self::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// A guest's answer to an invite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    Accept,
    Decline,
    /// Anything else the guest sent while the invite was pending.
    Garbled(String),
}

impl Answer {
    pub fn outcome(&self) -> InviteOutcome {
        match self {
            Answer::Accept => InviteOutcome::Accepted,
            Answer::Decline => InviteOutcome::Declined,
            Answer::Garbled(_) => InviteOutcome::UnexpectedResponse,
        }
    }
}

/// A message sent by the server on a lobby connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Ok {
        message: String,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
    Users {
        users: Vec<String>,
    },
    /// Sent to the host: the invite exists and the guest has been notified.
    Invited {
        token: InviteToken,
        guest: String,
        expires_in_ms: u64,
    },
    /// Sent to the guest.
    Invitation {
        token: InviteToken,
        host: String,
        while_playing: bool,
        expires_in_ms: u64,
        message: String,
    },
    /// Sent to the host once the invite resolves.
    InviteResult {
        token: InviteToken,
        outcome: InviteOutcome,
    },
    /// Sent to the guest when an invite it was shown resolved without its answer.
    InviteClosed {
        token: InviteToken,
        outcome: InviteOutcome,
    },
    /// Sent to the guest: open a direct connection to the host.
    ConnectTo {
        token: InviteToken,
        host: String,
        addr: IpAddr,
        port: u16,
    },
    HandoffAborted {
        token: InviteToken,
        reason: String,
    },
    StatusChanged {
        status: Status,
    },
}

impl ServerMessage {
    pub fn ok(message: impl Into<String>) -> Self {
        ServerMessage::Ok {
            message: message.into(),
        }
    }

    pub fn error(err: &LobbyError) -> Self {
        ServerMessage::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// Messages the server pushes unprompted, as opposed to command replies.
    pub fn is_push(&self) -> bool {
        matches!(
            self,
            ServerMessage::Invitation { .. }
                | ServerMessage::InviteResult { .. }
                | ServerMessage::InviteClosed { .. }
                | ServerMessage::ConnectTo { .. }
                | ServerMessage::HandoffAborted { .. }
                | ServerMessage::StatusChanged { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_text_commands() {
        assert_eq!(
            Request::parse("GAME_INI alice bob").unwrap(),
            Request::GameIni {
                host: "alice".into(),
                guest: "bob".into()
            }
        );
        assert_eq!(
            Request::parse("  LIST_USERS_PLAYING \r").unwrap(),
            Request::ListUsersPlaying
        );
        assert_eq!(
            Request::parse("SEND_GUEST_CONN_PORT bob 40123").unwrap(),
            Request::SendGuestConnPort {
                guest: "bob".into(),
                port: 40123
            }
        );
    }

    #[test]
    fn answer_aliases() {
        assert_eq!(
            Request::parse("GAME_ACK").unwrap(),
            Request::Accept { token: None }
        );
        assert_eq!(
            Request::parse("DECLINE 00000001-abcdef01").unwrap(),
            Request::Decline {
                token: Some("00000001-abcdef01".into())
            }
        );
    }

    #[test]
    fn missing_arguments_report_usage() {
        let err = Request::parse("LOGIN alice").unwrap_err();
        assert!(matches!(err, LobbyError::InvalidMessage(ref m) if m.contains("usage")));
        assert!(Request::parse("SEND_GUEST_CONN_PORT bob notaport").is_err());
        assert!(Request::parse("SEND_GUEST_CONN_PORT bob 0").is_err());
        assert!(Request::parse("").is_err());
    }

    #[test]
    fn unknown_commands() {
        assert!(Request::parse("FLY away").is_err());
        assert!(!is_known_command("FLY away"));
        assert!(is_known_command("LOGIN a"));
        assert!(!is_known_command("   "));
    }

    #[test]
    fn parse_json_form() {
        let line = r#"{"cmd":"LOGIN","user":"alice","password":"pw"}"#;
        assert_eq!(
            Request::parse(line).unwrap(),
            Request::Login {
                user: "alice".into(),
                password: "pw".into()
            }
        );
        let json = serde_json::to_string(&Request::Accept { token: None }).unwrap();
        assert_eq!(Request::parse(&json).unwrap(), Request::Accept { token: None });
    }

    #[test]
    fn outcome_semantics() {
        assert_eq!(InviteOutcome::Aborted.status(), InviteStatus::Declined);
        assert_eq!(
            InviteOutcome::UnexpectedResponse.to_string(),
            "UNEXPECTED RESPONSE"
        );
        assert!(!InviteOutcome::Timeout.releases_guest());
        assert!(InviteOutcome::Ignored.releases_guest());
        assert_eq!(Answer::Garbled("x".into()).outcome(), InviteOutcome::UnexpectedResponse);
    }

    #[test]
    fn server_message_tagging() {
        let msg = ServerMessage::InviteResult {
            token: "00000001-00000000".into(),
            outcome: InviteOutcome::Timeout,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"invite_result\""));
        assert!(json.contains("\"outcome\":\"TIMEOUT\""));
        assert!(msg.is_push());
        assert!(!ServerMessage::ok("fine").is_push());
    }
}
