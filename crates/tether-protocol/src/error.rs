//! Error types for the protocol layer.

/// Errors that can occur while encoding, decoding, or classifying frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning a Rust type into text).
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed (turning text into a Rust type).
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The frame is not a message this protocol accepts.
    ///
    /// Carries whatever could be salvaged from the frame, so the caller
    /// can still address an `UnknownError` response to the request.
    #[error("invalid message: {reason}")]
    InvalidMessage {
        reason: String,
        responding_to: Option<String>,
        req_id: Option<String>,
    },
}

impl ProtocolError {
    /// Shorthand for an [`InvalidMessage`](Self::InvalidMessage) with
    /// nothing salvaged.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidMessage {
            reason: reason.into(),
            responding_to: None,
            req_id: None,
        }
    }

    /// The request id salvaged from the offending frame, if any.
    pub fn req_id(&self) -> Option<&str> {
        match self {
            Self::InvalidMessage { req_id, .. } => req_id.as_deref(),
            _ => None,
        }
    }

    /// The `type` salvaged from the offending frame, if any.
    pub fn responding_to(&self) -> Option<&str> {
        match self {
            Self::InvalidMessage { responding_to, .. } => responding_to.as_deref(),
            _ => None,
        }
    }
}
