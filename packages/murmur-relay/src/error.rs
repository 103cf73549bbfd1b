//! Errors raised while handling a client envelope.
//!
//! A handler error never tears down the connection. Rejections are reported
//! to the offending client as `ServerMessage::Error`; storage failures are
//! logged only, since in-memory reachability stays authoritative.

use thiserror::Error;

use crate::store::StoreError;

pub type RelayResult<T> = std::result::Result<T, RelayError>;

#[derive(Error, Debug)]
pub enum RelayError {
    /// The envelope claims a sender other than the authenticated identity.
    #[error("Sender does not match the registered identity")]
    SenderMismatch,

    #[error("Message '{0}' not found")]
    MessageNotFound(String),

    /// Only the author may act on this message.
    #[error("Only the sender of message '{0}' may do that")]
    NotMessageSender(String),

    /// Reactions are limited to the two participants of a message.
    #[error("Not a participant of message '{0}'")]
    NotParticipant(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RelayError {
    /// Whether the client should be told about this error.
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, Self::Store(_))
    }
}
