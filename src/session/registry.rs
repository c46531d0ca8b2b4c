//! Session Registry
//!
//! Tracks the live sessions the device will answer requests for.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::types::Result;

use super::Session;

/// Storage collaborator for sessions that must survive restarts
pub trait SessionPersistence: Send + Sync {
    /// Persist a newly added session
    fn save(&self, session: &Session) -> Result<()>;

    /// Forget a persisted session
    fn remove(&self, session_id: &str) -> Result<()>;
}

/// Persistence that keeps nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPersistence;

impl SessionPersistence for NullPersistence {
    fn save(&self, _session: &Session) -> Result<()> {
        Ok(())
    }

    fn remove(&self, _session_id: &str) -> Result<()> {
        Ok(())
    }
}

/// In-memory session table indexed by session (= pairing) id
pub struct SessionRegistry {
    /// Active sessions by id
    sessions: DashMap<String, Arc<Session>>,

    persistence: Arc<dyn SessionPersistence>,
}

impl SessionRegistry {
    /// Create a registry backed by the given persistence collaborator
    pub fn new(persistence: Arc<dyn SessionPersistence>) -> Self {
        Self {
            sessions: DashMap::new(),
            persistence,
        }
    }

    /// Add a session, replacing any session for the same pairing.
    ///
    /// Temporary sessions are indexed but never handed to persistence.
    /// Returns the session that was replaced, if any.
    pub fn add(&self, session: Arc<Session>, temporary: bool) -> Option<Arc<Session>> {
        if !temporary {
            if let Err(e) = self.persistence.save(&session) {
                warn!(session_id = %session.id(), "Failed to persist session: {}", e);
            }
        }

        let id = session.id().to_string();
        let replaced = self.sessions.insert(id.clone(), session);

        if replaced.is_some() {
            info!(session_id = %id, temporary, "Replaced existing session for pairing");
        } else {
            info!(session_id = %id, temporary, "Added session");
        }

        replaced
    }

    /// Remove a session. Removing an absent or already replaced session is a no-op.
    pub fn remove(&self, session: &Session) -> bool {
        let removed = self
            .sessions
            .remove_if(session.id(), |_, current| current.same_channel(session))
            .is_some();

        if removed {
            if let Err(e) = self.persistence.remove(session.id()) {
                warn!(session_id = %session.id(), "Failed to remove persisted session: {}", e);
            }
            info!(session_id = %session.id(), "Removed session");
        } else {
            debug!(session_id = %session.id(), "Remove ignored, session not registered");
        }

        removed
    }

    /// Look up by session or pairing id (they are the same value)
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| Arc::clone(s.value()))
    }

    /// Whether this exact session is still registered
    pub fn is_live(&self, session: &Session) -> bool {
        self.sessions
            .get(session.id())
            .map(|current| current.same_channel(session))
            .unwrap_or(false)
    }

    /// Snapshot of all sessions, in no particular order
    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|s| Arc::clone(s.value())).collect()
    }

    /// Snapshot of all sessions, newest first
    pub fn all_by_recency(&self) -> Vec<Arc<Session>> {
        let mut sessions = self.all();
        sessions.sort_by(|a, b| b.created().cmp(&a.created()));
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(Arc::new(NullPersistence))
    }
}
