//! Session types: configuration, peer roles, and the outbound side of a
//! connection as the relay sees it.
//!
//! A session pairs at most one controller with at most one editor. The
//! relay never owns a connection; it holds a [`Peer`], which is the
//! connection's id plus a channel into that connection's writer task.

use std::fmt;
use std::time::Duration;

use tether_protocol::{Codec, JsonCodec, ServerMessage, SessionId};
use tether_transport::ConnectionId;
use tokio::sync::mpsc;

use crate::SessionHandle;

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Timeouts shared by every session on the server.
///
/// These are server-wide; a single session can't override them.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a session may go without inbound traffic before it is
    /// destroyed. Default: 10 minutes.
    pub idle_timeout: Duration,

    /// How long editor requests wait in the outbox for the controller
    /// to come back. Default: 10 seconds.
    pub outbox_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(10 * 60),
            outbox_timeout: Duration::from_secs(10),
        }
    }
}

// ---------------------------------------------------------------------------
// Role / ConnectionRole
// ---------------------------------------------------------------------------

/// Which slot of a session a peer occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The automation agent that created the session.
    Controller,
    /// The interactive client that joined it.
    Editor,
}

impl Role {
    /// The role on the other end of the relay.
    pub fn other(self) -> Self {
        match self {
            Self::Controller => Self::Editor,
            Self::Editor => Self::Controller,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Controller => f.write_str("controller"),
            Self::Editor => f.write_str("editor"),
        }
    }
}

/// What a connection is bound to.
///
/// ```text
///            create / rejoin                 join
///   Unbound ───────────────→ Controller   Unbound ─────→ Editor
/// ```
///
/// Only the [`SessionManager`](crate::SessionManager) produces bound
/// values; the connection handler just stores whatever it returns.
#[derive(Debug, Clone, Default)]
pub enum ConnectionRole {
    #[default]
    Unbound,
    Controller(SessionHandle),
    Editor(SessionHandle),
}

impl ConnectionRole {
    /// The bound session and the role held in it.
    pub fn session(&self) -> Option<(&SessionHandle, Role)> {
        match self {
            Self::Unbound => None,
            Self::Controller(session) => Some((session, Role::Controller)),
            Self::Editor(session) => Some((session, Role::Editor)),
        }
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session().map(|(session, _)| session.id())
    }

    pub fn is_bound(&self) -> bool {
        !matches!(self, Self::Unbound)
    }
}

// ---------------------------------------------------------------------------
// Peer
// ---------------------------------------------------------------------------

/// A frame (or close request) headed for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close,
}

/// Channel into a connection's writer task.
pub type PeerSender = mpsc::UnboundedSender<Outbound>;

/// The relay's reference to a connection.
///
/// Every send is best-effort: if the connection's writer is gone the
/// frame is dropped, and the connection's own close path detaches it.
#[derive(Debug, Clone)]
pub struct Peer {
    id: ConnectionId,
    sender: PeerSender,
}

impl Peer {
    pub fn new(id: ConnectionId, sender: PeerSender) -> Self {
        Self { id, sender }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues a text frame verbatim.
    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.sender.send(Outbound::Text(text.into()));
    }

    /// Encodes and queues a relay-originated message.
    pub fn send_message(&self, msg: &ServerMessage) {
        match JsonCodec.encode(msg) {
            Ok(text) => self.send_text(text),
            Err(e) => tracing::warn!(conn_id = %self.id, error = %e, "failed to encode message"),
        }
    }

    /// Asks the connection's writer to close the connection.
    pub fn close(&self) {
        let _ = self.sender.send(Outbound::Close);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_default_timeouts() {
        let config = SessionConfig::default();
        assert_eq!(config.idle_timeout, Duration::from_secs(600));
        assert_eq!(config.outbox_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_role_other_swaps() {
        assert_eq!(Role::Controller.other(), Role::Editor);
        assert_eq!(Role::Editor.other(), Role::Controller);
    }

    #[test]
    fn test_connection_role_default_is_unbound() {
        let role = ConnectionRole::default();
        assert!(!role.is_bound());
        assert!(role.session_id().is_none());
    }

    #[test]
    fn test_peer_send_message_encodes_json() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let peer = Peer::new(ConnectionId::new(1), tx);

        peer.send_message(&ServerMessage::idle_timeout("bye"));
        peer.close();

        match rx.try_recv().unwrap() {
            Outbound::Text(text) => {
                let json: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_eq!(json["type"], "IdleTimeout");
            }
            other => panic!("expected text, got {other:?}"),
        }
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
    }

    #[test]
    fn test_peer_send_after_receiver_dropped_is_silent() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let peer = Peer::new(ConnectionId::new(2), tx);
        peer.send_text("lost");
        peer.close();
    }
}
