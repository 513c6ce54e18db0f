//! lobby-core: Shared protocol library for the game lobby.
//!
//! Provides the line-framed JSON message types, the line codec, presence
//! enums, invite tokens and the common error type.

pub mod codec;
pub mod error;
pub mod messages;
pub mod presence;
pub mod token;

// Re-export commonly used items at crate root.
pub use codec::{decode_line, encode_line, FramedReader, LineDecoder, DEFAULT_MAX_LINE};
pub use error::{LobbyError, LobbyResult};
pub use messages::{
    is_known_command, Answer, ErrorKind, InviteOutcome, InviteStatus, Request, ServerMessage,
};
pub use presence::{Notification, Status};
pub use token::{InviteToken, TokenIssuer};
