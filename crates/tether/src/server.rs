//! `TetherServer` builder and server loop.
//!
//! This is the entry point for running a Tether relay. It ties together
//! all the layers: transport → protocol → session.

use std::future::Future;
use std::sync::Arc;

use tether_session::{SessionConfig, SessionManager};
use tether_transport::{Transport, WebSocketTransport};

use crate::TetherError;
use crate::handler::handle_connection;

/// Shared server state passed to each connection handler task.
///
/// Everything mutable lives behind the session actors, so the state
/// itself needs no lock.
pub(crate) struct ServerState {
    pub(crate) sessions: SessionManager,
}

/// Builder for configuring and starting a Tether server.
///
/// # Example
///
/// ```rust,no_run
/// use tether::prelude::*;
///
/// # async fn start() -> Result<(), TetherError> {
/// let server = TetherServer::builder()
///     .bind("0.0.0.0:3000")
///     .build()
///     .await?;
/// server.run().await
/// # }
/// ```
pub struct TetherServerBuilder {
    bind_addr: String,
    session_config: SessionConfig,
}

impl TetherServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            session_config: SessionConfig::default(),
        }
    }

    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.bind_addr = addr.to_string();
        self
    }

    /// Sets the session timeouts.
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Binds the listener. Connections are accepted once [`TetherServer::run`]
    /// is called.
    pub async fn build(self) -> Result<TetherServer, TetherError> {
        let transport = WebSocketTransport::bind(&self.bind_addr).await?;

        let state = Arc::new(ServerState {
            sessions: SessionManager::new(self.session_config),
        });

        Ok(TetherServer { transport, state })
    }
}

impl Default for TetherServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A bound Tether relay.
///
/// Call [`run()`](Self::run) to start accepting connections.
pub struct TetherServer {
    transport: WebSocketTransport,
    state: Arc<ServerState>,
}

impl TetherServer {
    /// Creates a new builder.
    pub fn builder() -> TetherServerBuilder {
        TetherServerBuilder::new()
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.transport.local_addr()
    }

    /// The lifecycle manager shared by every connection.
    pub fn sessions(&self) -> &SessionManager {
        &self.state.sessions
    }

    /// Runs the accept loop until the process is terminated.
    pub async fn run(self) -> Result<(), TetherError> {
        self.run_until(std::future::pending()).await
    }

    /// Runs the accept loop until `shutdown` completes.
    ///
    /// Each accepted connection gets its own task, which runs the
    /// WebSocket handshake and then the handler. Connections
    /// already being served keep running after the loop stops.
    pub async fn run_until(
        mut self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), TetherError> {
        tracing::info!("Tether relay running");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                accepted = self.transport.accept_pending() => match accepted {
                    Ok(pending) => {
                        let state = Arc::clone(&self.state);
                        tokio::spawn(async move {
                            let addr = pending.peer_addr();
                            let conn = match pending.upgrade().await {
                                Ok(conn) => conn,
                                Err(e) => {
                                    tracing::debug!(%addr, error = %e, "handshake failed");
                                    return;
                                }
                            };
                            if let Err(e) = handle_connection(conn, state).await {
                                tracing::debug!(
                                    error = %e,
                                    "connection ended with error"
                                );
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                    }
                },
            }
        }

        self.transport.shutdown().await?;
        tracing::info!("Tether relay stopped");
        Ok(())
    }
}
