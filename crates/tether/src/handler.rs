//! Per-connection handler: heartbeat, classification, and routing.
//!
//! Each accepted connection gets its own Tokio task running this handler,
//! plus a writer task that drains the connection's outbound channel. The
//! flow is:
//!   1. `ping` → `pong`, before any parsing
//!   2. Control requests → [`SessionManager`](tether_session::SessionManager)
//!   3. Everything else → the bound session's relay
//!   4. Malformed input → `UnknownError` (if a reqId was salvaged), then close

use std::sync::Arc;

use tether_protocol::{ErrorKind, Inbound, PONG, ProtocolError, ServerMessage};
use tether_session::{ConnectionRole, Outbound, Peer};
use tether_transport::{Connection, ConnectionId, WebSocketConnection};
use tokio::sync::mpsc;

use crate::TetherError;
use crate::server::ServerState;

/// Whether the reader should keep going after a frame.
enum Flow {
    Continue,
    Close,
}

/// The connection's current binding.
///
/// Dropping it detaches the connection from its session slot. Since
/// `Drop` is synchronous, the detach is a fire-and-forget task.
struct Binding {
    conn_id: ConnectionId,
    role: ConnectionRole,
}

impl Binding {
    /// Switches to `role`, releasing the previous slot first.
    async fn rebind(&mut self, role: ConnectionRole) {
        let previous = std::mem::replace(&mut self.role, role);
        if let Some((session, role)) = previous.session() {
            let _ = session.detach(role, self.conn_id).await;
        }
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        let role = std::mem::take(&mut self.role);
        let conn_id = self.conn_id;
        if role.is_bound() {
            tokio::spawn(async move {
                if let Some((session, role)) = role.session() {
                    let _ = session.detach(role, conn_id).await;
                }
            });
        }
    }
}

/// Handles a single connection from accept to close.
pub(crate) async fn handle_connection(
    conn: WebSocketConnection,
    state: Arc<ServerState>,
) -> Result<(), TetherError> {
    let conn = Arc::new(conn);
    let conn_id = conn.id();
    tracing::debug!(%conn_id, "handling new connection");

    let (tx, rx) = mpsc::unbounded_channel();
    let peer = Peer::new(conn_id, tx);
    let mut writer = tokio::spawn(write_outbound(Arc::clone(&conn), rx));
    let mut writer_done = false;
    let mut binding = Binding {
        conn_id,
        role: ConnectionRole::Unbound,
    };

    let result = loop {
        tokio::select! {
            frame = conn.recv() => match frame {
                Ok(Some(text)) => {
                    if let Flow::Close = handle_frame(&text, &state, &peer, &mut binding).await {
                        break Ok(());
                    }
                }
                Ok(None) => {
                    tracing::debug!(%conn_id, "connection closed by peer");
                    break Ok(());
                }
                Err(e) => break Err(TetherError::Transport(e)),
            },
            _ = &mut writer => {
                // The relay closed us (outbox eviction or idle expiry), or
                // the socket stopped accepting writes.
                writer_done = true;
                break Ok(());
            }
        }
    };

    drop(binding);
    if !writer_done {
        peer.close();
        let _ = writer.await;
    }
    tracing::debug!(%conn_id, "connection handler finished");
    result
}

/// Handles one inbound frame.
async fn handle_frame(
    text: &str,
    state: &ServerState,
    peer: &Peer,
    binding: &mut Binding,
) -> Flow {
    let inbound = match Inbound::parse(text) {
        Ok(inbound) => inbound,
        Err(e) => {
            tracing::debug!(conn_id = %peer.id(), error = %e, "malformed frame");
            reject_unknown(peer, &e);
            return Flow::Close;
        }
    };

    match inbound {
        Inbound::Heartbeat => peer.send_text(PONG),

        Inbound::Control(request) => {
            let kind = request.type_name();
            let session_id = request.session_id().clone();
            match state.sessions.handle(request, peer.clone()).await {
                Ok(role) => {
                    tracing::debug!(conn_id = %peer.id(), %session_id, kind, "connection bound");
                    binding.rebind(role).await;
                }
                Err(e) => {
                    tracing::debug!(
                        conn_id = %peer.id(),
                        %session_id,
                        kind,
                        error = %e,
                        "control request failed"
                    );
                }
            }
        }

        Inbound::Relay(message) => {
            let Some((session, role)) = binding.role.session() else {
                tracing::debug!(
                    conn_id = %peer.id(),
                    kind = message.kind(),
                    "message from unbound connection"
                );
                reject_unknown(
                    peer,
                    &ProtocolError::InvalidMessage {
                        reason: "connection is not bound to a session".into(),
                        responding_to: Some(message.kind().to_owned()),
                        req_id: message.req_id().map(str::to_owned),
                    },
                );
                return Flow::Close;
            };

            let kind = message.kind().to_owned();
            let req_id = message.req_id().map(str::to_owned);
            if let Err(e) = session.relay(role, peer.clone(), message).await {
                // The session ended between frames; its IdleTimeout and
                // close are already queued for this connection.
                tracing::debug!(conn_id = %peer.id(), error = %e, "relay to ended session");
                if req_id.is_some() {
                    peer.send_message(&ServerMessage::failure(
                        kind,
                        req_id,
                        e.kind(),
                        e.to_string(),
                    ));
                }
                binding.role = ConnectionRole::Unbound;
            }
        }
    }

    Flow::Continue
}

/// Answers a frame that can't be processed, then closes the connection.
///
/// Without a salvaged reqId there is nothing to answer; the close alone
/// tells the client.
fn reject_unknown(peer: &Peer, err: &ProtocolError) {
    if let Some(req_id) = err.req_id() {
        peer.send_message(&ServerMessage::failure(
            err.responding_to().unwrap_or("Unknown"),
            Some(req_id.to_owned()),
            ErrorKind::UnknownError,
            "Unknown error",
        ));
    }
    tracing::warn!(conn_id = %peer.id(), "closing connection after malformed input");
    peer.close();
}

/// Writes queued frames to the socket until a close is requested or the
/// socket fails.
async fn write_outbound(
    conn: Arc<WebSocketConnection>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let conn_id = conn.id();
    while let Some(frame) = outbound.recv().await {
        match frame {
            Outbound::Text(text) => {
                if let Err(e) = conn.send(&text).await {
                    tracing::debug!(%conn_id, error = %e, "send failed");
                    return;
                }
            }
            Outbound::Close => {
                if let Err(e) = conn.close().await {
                    tracing::debug!(%conn_id, error = %e, "close failed");
                }
                return;
            }
        }
    }
}
