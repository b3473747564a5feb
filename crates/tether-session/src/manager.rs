//! The session lifecycle manager: create, join, and rejoin.
//!
//! Each operation answers the requesting connection with exactly one
//! `ConfirmationResponse`. Successes are sent by the session actor (so a
//! rejoin's confirmation precedes the outbox it drains); failures are sent
//! from here.

use rand::Rng;
use tether_protocol::{ControlRequest, ReconnectToken, ServerMessage, SessionId};

use crate::{ConnectionRole, Peer, SessionConfig, SessionError, SessionHandle, SessionRegistry};

/// Resolves control requests against the [`SessionRegistry`].
///
/// ```text
/// SessionCreate ──→ create() ──→ [controller bound] ──(close)──→ [controller slot empty]
///                                                                      │
/// SessionJoin   ──→ join()   ──→ [editor bound]                        │
///                                                                      ▼
/// SessionRejoin ──→ rejoin() ──→ token check ──→ [controller bound] + outbox drained
/// ```
///
/// Sessions are never destroyed here; only the idle watchdog does that.
#[derive(Debug, Clone)]
pub struct SessionManager {
    registry: SessionRegistry,
    config: SessionConfig,
}

impl SessionManager {
    /// Creates a manager over a fresh, empty registry.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_registry(SessionRegistry::new(), config)
    }

    /// Creates a manager over an existing registry.
    pub fn with_registry(registry: SessionRegistry, config: SessionConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Dispatches a control request and returns the connection's new role.
    pub async fn handle(
        &self,
        request: ControlRequest,
        peer: Peer,
    ) -> Result<ConnectionRole, SessionError> {
        match request {
            ControlRequest::SessionCreate { req_id, session_id } => self
                .create(req_id, session_id, peer)
                .await
                .map(ConnectionRole::Controller),
            ControlRequest::SessionJoin { req_id, session_id } => self
                .join(req_id, session_id, peer)
                .await
                .map(ConnectionRole::Editor),
            ControlRequest::SessionRejoin {
                req_id,
                session_id,
                reconnect_token,
            } => self
                .rejoin(req_id, session_id, reconnect_token, peer)
                .await
                .map(ConnectionRole::Controller),
        }
    }

    /// Creates a session with `controller` bound and a fresh reconnect
    /// token, and starts its idle watchdog.
    ///
    /// # Errors
    /// [`SessionError::IdTaken`] if `session_id` is live.
    pub async fn create(
        &self,
        req_id: String,
        session_id: SessionId,
        controller: Peer,
    ) -> Result<SessionHandle, SessionError> {
        let result = self
            .registry
            .create(
                session_id,
                controller.clone(),
                generate_token(),
                req_id.clone(),
                self.config.clone(),
            )
            .await;
        if let Err(e) = &result {
            reject(&controller, "SessionCreate", req_id, e);
        }
        result
    }

    /// Binds `editor` to an existing session. Leaves the controller slot
    /// alone.
    ///
    /// # Errors
    /// - [`SessionError::NotFound`]: no such session
    /// - [`SessionError::HasEditor`]: an editor is already bound
    pub async fn join(
        &self,
        req_id: String,
        session_id: SessionId,
        editor: Peer,
    ) -> Result<SessionHandle, SessionError> {
        let result = match self.registry.get(&session_id).await {
            None => Err(SessionError::NotFound(session_id)),
            Some(session) => session
                .join(editor.clone(), req_id.clone())
                .await
                .map(|()| session)
                .map_err(|e| match e {
                    SessionError::Unavailable(id) => SessionError::NotFound(id),
                    other => other,
                }),
        };
        if let Err(e) = &result {
            reject(&editor, "SessionJoin", req_id, e);
        }
        result
    }

    /// Rebinds a controller that presents the session's reconnect token,
    /// then delivers the outbox to it in arrival order.
    ///
    /// # Errors
    /// - [`SessionError::Expired`]: no such session (it may have idled out)
    /// - [`SessionError::InvalidToken`]: token mismatch; nothing changes
    /// - [`SessionError::ControllerAlreadyConnected`]: the slot is taken
    pub async fn rejoin(
        &self,
        req_id: String,
        session_id: SessionId,
        token: ReconnectToken,
        controller: Peer,
    ) -> Result<SessionHandle, SessionError> {
        let result = match self.registry.get(&session_id).await {
            None => Err(SessionError::Expired(session_id)),
            Some(session) => session
                .rejoin(controller.clone(), req_id.clone(), token)
                .await
                .map(|()| session)
                .map_err(|e| match e {
                    SessionError::Unavailable(id) => SessionError::Expired(id),
                    other => other,
                }),
        };
        if let Err(e) = &result {
            reject(&controller, "SessionRejoin", req_id, e);
        }
        result
    }
}

/// Sends the failed confirmation for a lifecycle operation.
fn reject(peer: &Peer, responding_to: &str, req_id: String, err: &SessionError) {
    tracing::debug!(conn_id = %peer.id(), responding_to, error = %err, "control request rejected");
    peer.send_message(&ServerMessage::failure(
        responding_to,
        Some(req_id),
        err.kind(),
        err.to_string(),
    ));
}

/// Generates a random 32-character hex token (128 bits of entropy).
fn generate_token() -> ReconnectToken {
    let mut rng = rand::rng();
    let bytes: [u8; 16] = rng.random();
    ReconnectToken::new(bytes.iter().map(|b| format!("{b:02x}")).collect::<String>())
}

// =========================================================================
// Tests
// =========================================================================
