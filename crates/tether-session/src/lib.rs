//! Session management for Tether.
//!
//! A session pairs one controller (the automation agent that created it)
//! with at most one editor. This crate owns everything that happens once a
//! connection names a session:
//!
//! 1. **Registry**: which session ids are live ([`SessionRegistry`])
//! 2. **Lifecycle**: create, join, and token-checked rejoin ([`SessionManager`])
//! 3. **Relay**: verbatim forwarding between the two peers, with an
//!    outbox for editor requests while the controller is away
//! 4. **Expiry**: the idle watchdog that destroys quiet sessions
//!
//! # How it fits in the stack
//!
//! ```text
//! Server Layer (above)  ← one handler per connection, holds a ConnectionRole
//!     ↕
//! Session Layer (this crate)  ← one actor task per session
//!     ↕
//! Protocol Layer (below)  ← provides SessionId, ServerMessage, RelayMessage
//! ```

mod actor;
mod error;
mod manager;
mod registry;
mod session;

pub use actor::{SessionHandle, SessionInfo};
pub use error::SessionError;
pub use manager::SessionManager;
pub use registry::SessionRegistry;
pub use session::{ConnectionRole, Outbound, Peer, PeerSender, Role, SessionConfig};
