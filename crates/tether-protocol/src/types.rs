//! Core protocol types for Tether's wire format.
//!
//! Every frame is UTF-8 text: either one of the heartbeat tokens or a JSON
//! object carrying a `type` discriminator. Only the session control
//! requests are interpreted here; every other object is kept verbatim and
//! relayed untouched.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ProtocolError;

/// Heartbeat request token. Answered with [`PONG`] before any parsing.
pub const PING: &str = "ping";

/// Heartbeat reply token.
pub const PONG: &str = "pong";

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// The human-shareable pairing code chosen by the controller.
///
/// Serialized as a plain JSON string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Secret issued at session creation, required to rebind a controller.
///
/// `Debug` never prints the secret, so the token can't leak through
/// `tracing` fields or panic messages.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReconnectToken(String);

impl ReconnectToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ReconnectToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReconnectToken(..)")
    }
}

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Machine-readable failure reason carried by a failed
/// `ConfirmationResponse`. Serialized as the bare variant name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Create collided with a live session id.
    SessionIdTaken,
    /// Join/rejoin referenced an unknown or expired session.
    SessionIdNotExist,
    /// Join attempted on a session that already has an editor.
    SessionHasEditor,
    /// Rejoin credential mismatch.
    BadReconnectToken,
    /// Rejoin attempted while a controller is still bound.
    ControllerAlreadyConnected,
    /// The relay destination is currently absent.
    PeerNotConnected,
    /// Malformed input or an unexpected fault. The connection is closed
    /// right after this response.
    UnknownError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SessionIdTaken => "SessionIdTaken",
            Self::SessionIdNotExist => "SessionIdNotExist",
            Self::SessionHasEditor => "SessionHasEditor",
            Self::BadReconnectToken => "BadReconnectToken",
            Self::ControllerAlreadyConnected => "ControllerAlreadyConnected",
            Self::PeerNotConnected => "PeerNotConnected",
            Self::UnknownError => "UnknownError",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// ControlRequest: consumed by the session lifecycle
// ---------------------------------------------------------------------------

/// A session control request. Never relayed to the other peer.
///
/// ```json
/// { "type": "SessionRejoin", "reqId": "r3", "sessionId": "ABC123", "reconnectToken": "…" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ControlRequest {
    /// Controller → server: open a new session under `session_id`.
    SessionCreate {
        req_id: String,
        session_id: SessionId,
    },

    /// Editor → server: attach to an existing session.
    SessionJoin {
        req_id: String,
        session_id: SessionId,
    },

    /// Controller → server: resume a session after a disconnect.
    SessionRejoin {
        req_id: String,
        session_id: SessionId,
        #[serde(alias = "ccReconnectToken")]
        reconnect_token: ReconnectToken,
    },
}

impl ControlRequest {
    /// The `type` values that are routed to the session lifecycle.
    pub const TYPES: [&'static str; 3] = ["SessionCreate", "SessionJoin", "SessionRejoin"];

    /// Returns `true` if `kind` names a control request.
    pub fn is_control_type(kind: &str) -> bool {
        Self::TYPES.contains(&kind)
    }

    /// The wire `type` of this request.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::SessionCreate { .. } => "SessionCreate",
            Self::SessionJoin { .. } => "SessionJoin",
            Self::SessionRejoin { .. } => "SessionRejoin",
        }
    }

    pub fn req_id(&self) -> &str {
        match self {
            Self::SessionCreate { req_id, .. }
            | Self::SessionJoin { req_id, .. }
            | Self::SessionRejoin { req_id, .. } => req_id,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::SessionCreate { session_id, .. }
            | Self::SessionJoin { session_id, .. }
            | Self::SessionRejoin { session_id, .. } => session_id,
        }
    }
}

// ---------------------------------------------------------------------------
// ServerMessage: produced by the relay itself
// ---------------------------------------------------------------------------

/// Messages the relay originates (as opposed to relayed peer traffic).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Outcome of a request. Successful create/rejoin carry the reconnect
    /// token; failures carry `error` and a human-readable `message`.
    ConfirmationResponse {
        responding_to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        req_id: Option<String>,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reconnect_token: Option<ReconnectToken>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorKind>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// The session was destroyed for inactivity. No response expected.
    IdleTimeout { message: String },
}

impl ServerMessage {
    /// A successful confirmation, optionally echoing the reconnect token.
    pub fn success(
        responding_to: impl Into<String>,
        req_id: Option<String>,
        reconnect_token: Option<ReconnectToken>,
    ) -> Self {
        Self::ConfirmationResponse {
            responding_to: responding_to.into(),
            req_id,
            ok: true,
            reconnect_token,
            error: None,
            message: None,
        }
    }

    /// A failed confirmation.
    pub fn failure(
        responding_to: impl Into<String>,
        req_id: Option<String>,
        error: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self::ConfirmationResponse {
            responding_to: responding_to.into(),
            req_id,
            ok: false,
            reconnect_token: None,
            error: Some(error),
            message: Some(message.into()),
        }
    }

    pub fn idle_timeout(message: impl Into<String>) -> Self {
        Self::IdleTimeout {
            message: message.into(),
        }
    }

    /// The failure kind, if this is a failed confirmation.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::ConfirmationResponse { error, .. } => *error,
            Self::IdleTimeout { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// RelayMessage / Inbound
// ---------------------------------------------------------------------------

/// An opaque application message, kept byte-for-byte as received.
///
/// Only `type` and `reqId` are read; they decide whether the message can
/// be queued and how a synthesized failure is addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMessage {
    kind: String,
    req_id: Option<String>,
    raw: String,
}

impl RelayMessage {
    /// The message's `type`.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The message's `reqId`, if it is a request.
    pub fn req_id(&self) -> Option<&str> {
        self.req_id.as_deref()
    }

    /// The verbatim frame text.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// The literal [`PING`] token.
    Heartbeat,
    /// A session control request.
    Control(ControlRequest),
    /// Anything else: relayed to the other peer.
    Relay(RelayMessage),
}

impl Inbound {
    /// Classifies a text frame.
    ///
    /// The heartbeat check happens before any JSON parsing. Objects whose
    /// `type` is a control type must deserialize as a [`ControlRequest`];
    /// every other object with a string `type` becomes a [`RelayMessage`].
    ///
    /// # Errors
    /// [`ProtocolError::InvalidMessage`] for non-JSON text, non-object
    /// JSON, a missing or non-string `type`, a non-string `reqId`, or a
    /// control request with missing fields. The error keeps the `type` and
    /// `reqId` when they could be read.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        if text == PING {
            return Ok(Self::Heartbeat);
        }

        let value: Value = serde_json::from_str(text)
            .map_err(|e| ProtocolError::invalid(format!("not JSON: {e}")))?;
        let Value::Object(fields) = &value else {
            return Err(ProtocolError::invalid("expected a JSON object"));
        };

        let kind = match fields.get("type") {
            Some(Value::String(kind)) => Some(kind.clone()),
            _ => None,
        };
        let req_id = match fields.get("reqId") {
            None | Some(Value::Null) => None,
            Some(Value::String(id)) => Some(id.clone()),
            Some(_) => {
                return Err(ProtocolError::InvalidMessage {
                    reason: "reqId must be a string".into(),
                    responding_to: kind,
                    req_id: None,
                });
            }
        };
        let Some(kind) = kind else {
            return Err(ProtocolError::InvalidMessage {
                reason: "missing string `type`".into(),
                responding_to: None,
                req_id,
            });
        };

        if ControlRequest::is_control_type(&kind) {
            return serde_json::from_value(value).map(Self::Control).map_err(|e| {
                ProtocolError::InvalidMessage {
                    reason: e.to_string(),
                    responding_to: Some(kind),
                    req_id,
                }
            });
        }

        Ok(Self::Relay(RelayMessage {
            kind,
            req_id,
            raw: text.to_owned(),
        }))
    }
}

// =========================================================================
// Tests
// =========================================================================
