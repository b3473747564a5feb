//! # Tether
//!
//! A WebSocket relay that pairs a controller (an automation agent) with an
//! editor (an interactive client) through named, resumable sessions.
//!
//! The controller creates a session and receives a reconnect token; the
//! editor joins it by id. From then on every message is forwarded verbatim
//! to the other side. Editor requests sent while the controller is away are
//! held for a short window and delivered when it rejoins with its token.
//! Sessions with no traffic for ten minutes are destroyed.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tether::prelude::*;
//!
//! # async fn start() -> Result<(), TetherError> {
//! let server = TetherServer::builder()
//!     .bind("0.0.0.0:3000")
//!     .build()
//!     .await?;
//! server.run().await
//! # }
//! ```

mod error;
mod handler;
mod server;

pub use error::TetherError;
pub use server::{TetherServer, TetherServerBuilder};

/// Re-exports of the types a server embedder needs.
pub mod prelude {
    pub use crate::{TetherError, TetherServer, TetherServerBuilder};
    pub use tether_protocol::{ErrorKind, ReconnectToken, ServerMessage, SessionId};
    pub use tether_session::{SessionConfig, SessionError, SessionInfo, SessionManager};
    pub use tether_transport::TransportError;
}
