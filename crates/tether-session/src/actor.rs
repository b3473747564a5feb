//! Session actor: an isolated Tokio task that owns one session.
//!
//! Peer slots, the reconnect token, the outbox, and both timers live in
//! the actor and are only touched from its loop. Everything else talks to
//! it through [`SessionHandle`], so an inbound message and a firing timer
//! can never mutate the same session concurrently.
//!
//! Timers are plain deadlines raced against the command channel. Resetting
//! the idle timer or cancelling the outbox timer is a field assignment, so
//! a cancelled timer has nothing left that could fire late.

use std::collections::VecDeque;
use std::time::Duration;

use tether_protocol::{ErrorKind, ReconnectToken, RelayMessage, ServerMessage, SessionId};
use tether_transport::ConnectionId;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};

use crate::{Peer, Role, SessionConfig, SessionError, SessionRegistry};

/// Command channel size per session.
const COMMAND_CHANNEL_SIZE: usize = 64;

/// Commands sent to a session actor through its channel.
pub(crate) enum SessionCommand {
    /// Bind an editor.
    Join {
        editor: Peer,
        req_id: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },

    /// Rebind the controller after verifying its token.
    Rejoin {
        controller: Peer,
        req_id: String,
        token: ReconnectToken,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },

    /// Route a message from one bound peer to the other.
    Relay {
        from: Role,
        sender: Peer,
        message: RelayMessage,
    },

    /// A connection closed; free its slot if it still holds it.
    Detach { role: Role, conn_id: ConnectionId },

    /// Snapshot the session's presence state.
    GetInfo { reply: oneshot::Sender<SessionInfo> },
}

/// A snapshot of a session's presence state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub controller_connected: bool,
    pub editor_connected: bool,
    /// Editor requests waiting for the controller.
    pub outbox_len: usize,
}

/// Handle to a running session actor.
///
/// Cheap to clone. The registry holds one per live session; each bound
/// connection holds another inside its
/// [`ConnectionRole`](crate::ConnectionRole).
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session_id: SessionId,
    instance: u64,
    sender: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub fn id(&self) -> &SessionId {
        &self.session_id
    }

    /// Distinguishes this session from any later one reusing its id.
    pub(crate) fn instance(&self) -> u64 {
        self.instance
    }

    fn unavailable(&self) -> SessionError {
        SessionError::Unavailable(self.session_id.clone())
    }

    pub(crate) async fn join(&self, editor: Peer, req_id: String) -> Result<(), SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::Join {
                editor,
                req_id,
                reply: reply_tx,
            })
            .await
            .map_err(|_| self.unavailable())?;
        reply_rx.await.map_err(|_| self.unavailable())?
    }

    pub(crate) async fn rejoin(
        &self,
        controller: Peer,
        req_id: String,
        token: ReconnectToken,
    ) -> Result<(), SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::Rejoin {
                controller,
                req_id,
                token,
                reply: reply_tx,
            })
            .await
            .map_err(|_| self.unavailable())?;
        reply_rx.await.map_err(|_| self.unavailable())?
    }

    /// Relays a message from the peer bound as `from` (fire-and-forget).
    ///
    /// Failures caused by an absent destination are reported to `sender`
    /// by the actor itself; this only fails if the session has ended.
    pub async fn relay(
        &self,
        from: Role,
        sender: Peer,
        message: RelayMessage,
    ) -> Result<(), SessionError> {
        self.sender
            .send(SessionCommand::Relay {
                from,
                sender,
                message,
            })
            .await
            .map_err(|_| self.unavailable())
    }

    /// Frees the `role` slot if `conn_id` still holds it.
    pub async fn detach(&self, role: Role, conn_id: ConnectionId) -> Result<(), SessionError> {
        self.sender
            .send(SessionCommand::Detach { role, conn_id })
            .await
            .map_err(|_| self.unavailable())
    }

    /// Requests the current presence snapshot.
    ///
    /// Also a barrier: the reply comes after every command sent before it.
    pub async fn info(&self) -> Result<SessionInfo, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::GetInfo { reply: reply_tx })
            .await
            .map_err(|_| self.unavailable())?;
        reply_rx.await.map_err(|_| self.unavailable())
    }
}

/// The internal session state. Runs inside a Tokio task.
struct SessionActor {
    session_id: SessionId,
    instance: u64,
    config: SessionConfig,
    reconnect_token: ReconnectToken,
    controller: Option<Peer>,
    editor: Option<Peer>,
    /// Editor requests held while the controller is away, oldest first.
    outbox: VecDeque<RelayMessage>,
    outbox_deadline: Option<Instant>,
    idle_deadline: Instant,
    registry: SessionRegistry,
    receiver: mpsc::Receiver<SessionCommand>,
}

impl SessionActor {
    /// Runs the actor loop until the idle watchdog fires.
    async fn run(mut self, create_req_id: String) {
        tracing::info!(session_id = %self.session_id, "session created");

        // The creation confirmation goes out from here so it precedes
        // anything else the controller could receive.
        if let Some(controller) = &self.controller {
            controller.send_message(&ServerMessage::success(
                "SessionCreate",
                Some(create_req_id),
                Some(self.reconnect_token.clone()),
            ));
        }

        loop {
            let idle_deadline = self.idle_deadline;
            let outbox_deadline = self.outbox_deadline;

            tokio::select! {
                biased;

                () = time::sleep_until(idle_deadline) => {
                    self.expire().await;
                    break;
                }
                () = sleep_until_some(outbox_deadline) => {
                    self.evict_outbox();
                }
                cmd = self.receiver.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
            }
        }

        tracing::debug!(session_id = %self.session_id, "session actor stopped");
    }

    fn handle(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Join {
                editor,
                req_id,
                reply,
            } => {
                self.touch();
                let _ = reply.send(self.handle_join(editor, req_id));
            }
            SessionCommand::Rejoin {
                controller,
                req_id,
                token,
                reply,
            } => {
                self.touch();
                let _ = reply.send(self.handle_rejoin(controller, req_id, &token));
            }
            SessionCommand::Relay {
                from,
                sender,
                message,
            } => {
                self.touch();
                self.handle_relay(from, &sender, message);
            }
            SessionCommand::Detach { role, conn_id } => self.handle_detach(role, conn_id),
            SessionCommand::GetInfo { reply } => {
                let _ = reply.send(self.info());
            }
        }
    }

    fn handle_join(&mut self, editor: Peer, req_id: String) -> Result<(), SessionError> {
        if self.editor.is_some() {
            return Err(SessionError::HasEditor(self.session_id.clone()));
        }

        editor.send_message(&ServerMessage::success("SessionJoin", Some(req_id), None));
        tracing::info!(
            session_id = %self.session_id,
            conn_id = %editor.id(),
            "editor joined"
        );
        self.editor = Some(editor);
        Ok(())
    }

    fn handle_rejoin(
        &mut self,
        controller: Peer,
        req_id: String,
        token: &ReconnectToken,
    ) -> Result<(), SessionError> {
        if *token != self.reconnect_token {
            tracing::debug!(session_id = %self.session_id, "rejoin with wrong token");
            return Err(SessionError::InvalidToken);
        }
        if self.controller.is_some() {
            return Err(SessionError::ControllerAlreadyConnected(
                self.session_id.clone(),
            ));
        }

        controller.send_message(&ServerMessage::success(
            "SessionRejoin",
            Some(req_id),
            Some(self.reconnect_token.clone()),
        ));

        self.outbox_deadline = None;
        let queued = self.outbox.len();
        for message in self.outbox.drain(..) {
            controller.send_text(message.as_str());
        }

        tracing::info!(
            session_id = %self.session_id,
            conn_id = %controller.id(),
            delivered = queued,
            "controller rejoined"
        );
        self.controller = Some(controller);
        Ok(())
    }

    /// Forwards `message` to the other role, queues it, or fails it.
    ///
    /// A sender that no longer holds its slot (evicted, or replaced by a
    /// rejoin) gets `PeerNotConnected` for a request. Its broadcasts are
    /// dropped; the close already queued for that connection is the only
    /// outcome it sees.
    fn handle_relay(&mut self, from: Role, sender: &Peer, message: RelayMessage) {
        if self.slot(from).map(Peer::id) != Some(sender.id()) {
            tracing::debug!(
                session_id = %self.session_id,
                conn_id = %sender.id(),
                role = %from,
                kind = message.kind(),
                "message from a connection no longer bound"
            );
            if let Some(req_id) = message.req_id() {
                sender.send_message(&ServerMessage::failure(
                    message.kind(),
                    Some(req_id.to_owned()),
                    ErrorKind::PeerNotConnected,
                    format!("This connection is no longer the {from} of this session."),
                ));
            }
            return;
        }

        let destination = from.other();
        if let Some(target) = self.slot(destination) {
            target.send_text(message.as_str());
            tracing::trace!(
                session_id = %self.session_id,
                kind = message.kind(),
                to = %destination,
                "relayed"
            );
            return;
        }

        if destination == Role::Controller && message.req_id().is_some() {
            self.enqueue(message);
            return;
        }

        tracing::debug!(
            session_id = %self.session_id,
            kind = message.kind(),
            to = %destination,
            "destination absent"
        );
        sender.send_message(&ServerMessage::failure(
            message.kind(),
            message.req_id().map(str::to_owned),
            ErrorKind::PeerNotConnected,
            format!(
                "Tried sending a message to the {destination}, but it isn't connected on this session."
            ),
        ));
    }

    fn handle_detach(&mut self, role: Role, conn_id: ConnectionId) {
        let slot = match role {
            Role::Controller => &mut self.controller,
            Role::Editor => &mut self.editor,
        };
        if slot.as_ref().map(Peer::id) == Some(conn_id) {
            *slot = None;
            tracing::info!(
                session_id = %self.session_id,
                %conn_id,
                %role,
                "peer disconnected"
            );
        }
    }

    /// Queues an editor request for the absent controller and starts the
    /// eviction deadline on the first one.
    fn enqueue(&mut self, message: RelayMessage) {
        self.outbox.push_back(message);
        if self.outbox_deadline.is_none() {
            self.outbox_deadline = Some(Instant::now() + self.config.outbox_timeout);
        }
        tracing::debug!(
            session_id = %self.session_id,
            queued = self.outbox.len(),
            "queued request for absent controller"
        );
    }

    /// The controller didn't come back in time: fail every queued request
    /// to the editor and close the editor's connection.
    fn evict_outbox(&mut self) {
        self.outbox_deadline = None;
        let queued: Vec<RelayMessage> = self.outbox.drain(..).collect();

        let Some(editor) = self.editor.take() else {
            tracing::debug!(
                session_id = %self.session_id,
                discarded = queued.len(),
                "outbox expired with no editor bound"
            );
            return;
        };

        let text = format!(
            "Tried sending a message to the controller, but it did not connect within {}.",
            describe(self.config.outbox_timeout)
        );
        for message in &queued {
            editor.send_message(&ServerMessage::failure(
                message.kind(),
                message.req_id().map(str::to_owned),
                ErrorKind::PeerNotConnected,
                text.clone(),
            ));
        }
        editor.close();

        tracing::warn!(
            session_id = %self.session_id,
            conn_id = %editor.id(),
            failed = queued.len(),
            "outbox expired, closing editor"
        );
    }

    /// Idle watchdog fired: drop out of the registry first, then tell and
    /// close whoever is still bound.
    async fn expire(&mut self) {
        self.registry
            .remove_if_current(&self.session_id, self.instance)
            .await;

        let notice = ServerMessage::idle_timeout(format!(
            "{} passed without any activity.",
            describe(self.config.idle_timeout)
        ));
        for peer in [self.controller.take(), self.editor.take()]
            .into_iter()
            .flatten()
        {
            peer.send_message(&notice);
            peer.close();
        }

        tracing::info!(session_id = %self.session_id, "session expired (idle)");
    }

    /// Pushes the idle deadline out by a full timeout.
    fn touch(&mut self) {
        self.idle_deadline = Instant::now() + self.config.idle_timeout;
    }

    fn slot(&self, role: Role) -> Option<&Peer> {
        match role {
            Role::Controller => self.controller.as_ref(),
            Role::Editor => self.editor.as_ref(),
        }
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id.clone(),
            controller_connected: self.controller.is_some(),
            editor_connected: self.editor.is_some(),
            outbox_len: self.outbox.len(),
        }
    }
}

/// Sleeps until `deadline`, or forever when there is none.
async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// "10 seconds", "1 minute", "10 minutes".
fn describe(duration: Duration) -> String {
    let secs = duration.as_secs();
    match secs {
        60 => "1 minute".to_string(),
        s if s >= 60 && s % 60 == 0 => format!("{} minutes", s / 60),
        1 => "1 second".to_string(),
        s if s > 0 => format!("{s} seconds"),
        _ => format!("{} ms", duration.as_millis()),
    }
}

/// Parameters for a freshly created session.
pub(crate) struct NewSession {
    pub(crate) session_id: SessionId,
    pub(crate) instance: u64,
    pub(crate) controller: Peer,
    pub(crate) reconnect_token: ReconnectToken,
    pub(crate) create_req_id: String,
}

/// Spawns a new session actor and returns a handle to it.
///
/// The idle watchdog starts immediately.
pub(crate) fn spawn_session(
    new: NewSession,
    config: SessionConfig,
    registry: SessionRegistry,
) -> SessionHandle {
    let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);

    let actor = SessionActor {
        session_id: new.session_id.clone(),
        instance: new.instance,
        idle_deadline: Instant::now() + config.idle_timeout,
        config,
        reconnect_token: new.reconnect_token,
        controller: Some(new.controller),
        editor: None,
        outbox: VecDeque::new(),
        outbox_deadline: None,
        registry,
        receiver: rx,
    };

    tokio::spawn(actor.run(new.create_req_id));

    SessionHandle {
        session_id: new.session_id,
        instance: new.instance,
        sender: tx,
    }
}
