//! Presence state shared by server and clients.
//!
//! `Status` is the persisted online/playing state of a user. `Notification`
//! is the separate gate deciding whether a new invite may be delivered.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    #[default]
    Offline,
    Online,
    Playing,
}

impl Status {
    /// Whether the user has a live lobby connection.
    pub fn is_connected(self) -> bool {
        !matches!(self, Status::Offline)
    }

    /// Whether an invite may target a user in this status.
    pub fn is_invitable(self) -> bool {
        matches!(self, Status::Online | Status::Playing)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offline => write!(f, "OFFLINE"),
            Self::Online => write!(f, "ONLINE"),
            Self::Playing => write!(f, "PLAYING"),
        }
    }
}

impl FromStr for Status {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "OFFLINE" => Ok(Self::Offline),
            "ONLINE" => Ok(Self::Online),
            "PLAYING" => Ok(Self::Playing),
            _ => Err(format!("unknown status: {s}")),
        }
    }
}

/// Whether a user can be handed a new invite right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Notification {
    #[default]
    Available,
    Busy,
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Available => write!(f, "AVAILABLE"),
            Self::Busy => write!(f, "BUSY"),
        }
    }
}

impl FromStr for Notification {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "AVAILABLE" => Ok(Self::Available),
            "BUSY" => Ok(Self::Busy),
            _ => Err(format!("unknown notification state: {s}")),
        }
    }
}
