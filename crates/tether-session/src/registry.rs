//! The session registry: which sessions exist, keyed by id.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tether_protocol::{ReconnectToken, SessionId};
use tokio::sync::Mutex;

use crate::actor::{NewSession, spawn_session};
use crate::{Peer, SessionConfig, SessionError, SessionHandle};

/// Counter distinguishing successive sessions that reuse an id.
static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// The single source of truth for live sessions.
///
/// Cloning shares the same map. The composition root creates one and hands
/// it to the [`SessionManager`](crate::SessionManager); every session actor
/// keeps a clone so the idle watchdog can remove its own entry.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<SessionId, SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new session with `controller` bound, unless the id is
    /// already live. Check and insert happen under one lock.
    pub(crate) async fn create(
        &self,
        session_id: SessionId,
        controller: Peer,
        reconnect_token: ReconnectToken,
        create_req_id: String,
        config: SessionConfig,
    ) -> Result<SessionHandle, SessionError> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&session_id) {
            return Err(SessionError::IdTaken(session_id));
        }

        let handle = spawn_session(
            NewSession {
                session_id: session_id.clone(),
                instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
                controller,
                reconnect_token,
                create_req_id,
            },
            config,
            self.clone(),
        );
        sessions.insert(session_id, handle.clone());
        Ok(handle)
    }

    /// Looks up a live session.
    pub async fn get(&self, session_id: &SessionId) -> Option<SessionHandle> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    pub async fn contains(&self, session_id: &SessionId) -> bool {
        self.sessions.lock().await.contains_key(session_id)
    }

    /// Removes `session_id` only if it still maps to the given session
    /// instance, so a late removal can't evict a newer session that reused
    /// the id.
    pub(crate) async fn remove_if_current(&self, session_id: &SessionId, instance: u64) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(session_id) {
            Some(handle) if handle.instance() == instance => {
                sessions.remove(session_id);
                true
            }
            _ => false,
        }
    }

    /// Returns the number of live sessions.
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}
