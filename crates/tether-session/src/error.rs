//! Error types for the session layer.

use tether_protocol::{ErrorKind, SessionId};

/// Errors that can occur during session lifecycle and relay operations.
///
/// The display text doubles as the human-readable `message` of the
/// failed `ConfirmationResponse` sent back to the requester.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Create collided with a live session.
    #[error("Session ID already exists")]
    IdTaken(SessionId),

    /// Join referenced a session that doesn't exist.
    #[error("Session ID does not exist")]
    NotFound(SessionId),

    /// Rejoin referenced a session that doesn't exist (usually one that
    /// idled out while the controller was away).
    #[error("Cannot connect to an expired session ID")]
    Expired(SessionId),

    /// The session already has an editor bound.
    #[error("Someone is already editing this session")]
    HasEditor(SessionId),

    /// The reconnect token doesn't match the one issued at creation.
    #[error("Reconnect token incorrect")]
    InvalidToken,

    /// Rejoin attempted while a controller is still bound.
    #[error("A controller is already connected to this session")]
    ControllerAlreadyConnected(SessionId),

    /// The session actor has stopped; the session was destroyed.
    #[error("session {0} has ended")]
    Unavailable(SessionId),
}

impl SessionError {
    /// The wire error kind reported for this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::IdTaken(_) => ErrorKind::SessionIdTaken,
            Self::NotFound(_) | Self::Expired(_) | Self::Unavailable(_) => {
                ErrorKind::SessionIdNotExist
            }
            Self::HasEditor(_) => ErrorKind::SessionHasEditor,
            Self::InvalidToken => ErrorKind::BadReconnectToken,
            Self::ControllerAlreadyConnected(_) => ErrorKind::ControllerAlreadyConnected,
        }
    }
}
