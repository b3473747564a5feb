//! Wire protocol for Tether.
//!
//! This crate defines what travels between the relay and its two kinds of
//! peers:
//!
//! - **Types** ([`ControlRequest`], [`ServerMessage`], [`ErrorKind`], …):
//!   the messages the relay itself understands or produces.
//! - **Classification** ([`Inbound::parse`]): splitting a text frame into
//!   heartbeat, session control, or opaque relayed traffic.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]): how messages become text.
//! - **Errors** ([`ProtocolError`]).
//!
//! ```text
//! Transport (text frames) → Protocol (Inbound) → Session (routing)
//! ```

mod codec;
mod error;
mod types;

pub use codec::{Codec, JsonCodec};
pub use error::ProtocolError;
pub use types::{
    ControlRequest, ErrorKind, Inbound, PING, PONG, ReconnectToken, RelayMessage, ServerMessage,
    SessionId,
};
