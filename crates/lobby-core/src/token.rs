//! Invite tokens.
//!
//! Format: `[8 hex digit sequence]-[8 hex digit random suffix]`. The sequence
//! makes a token unique within a server process; the suffix keeps tokens
//! from being guessable by counting.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque identifier correlating an invite and its resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InviteToken(String);

impl InviteToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InviteToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InviteToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for InviteToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Issues tokens that are never reused for the lifetime of the issuer.
#[derive(Debug)]
pub struct TokenIssuer {
    next: AtomicU64,
}

impl TokenIssuer {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh token.
    pub fn issue(&self) -> InviteToken {
        use rand::Rng;
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        let suffix: [u8; 4] = rand::thread_rng().gen();
        InviteToken(format!("{seq:08x}-{}", hex::encode(suffix)))
    }
}

impl Default for TokenIssuer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn tokens_are_unique() {
        let issuer = TokenIssuer::new();
        let tokens: HashSet<InviteToken> = (0..1000).map(|_| issuer.issue()).collect();
        assert_eq!(tokens.len(), 1000);
    }

    #[test]
    fn token_format() {
        let token = TokenIssuer::new().issue();
        let (seq, suffix) = token.as_str().split_once('-').unwrap();
        assert_eq!(seq, "00000001");
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn serializes_as_plain_string() {
        let token = InviteToken::from("0000002a-deadbeef");
        assert_eq!(
            serde_json::to_string(&token).unwrap(),
            "\"0000002a-deadbeef\""
        );
    }
}
