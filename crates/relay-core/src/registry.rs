//! Registry of active sessions.
//!
//! The registry only references sessions; each one is owned by its
//! [`SessionHandler`](crate::SessionHandler), which registers it on entry and
//! removes it on exit.

use crate::session::SessionHandle;
use parking_lot::RwLock;
use relay_transport::ConnectionId;
use std::collections::HashMap;
use tracing::debug;

/// Concurrency-safe set of active sessions.
///
/// Reads (`count`, `snapshot`) share the lock; writes (`add`, `remove`) hold
/// it exclusively. No I/O ever happens under the lock.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    sessions: RwLock<HashMap<ConnectionId, SessionHandle>>,
}

impl ClientRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session.
    ///
    /// Returns `false` if a session with the same identity was already
    /// present, in which case the registry is left unchanged.
    pub fn add(&self, session: SessionHandle) -> bool {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(session.id()) {
            return false;
        }

        debug!(connection = %session.id(), total = sessions.len() + 1, "Session registered");
        sessions.insert(session.id().clone(), session);
        true
    }

    /// Deregister a session.
    ///
    /// Removing a session that is not registered is a no-op and returns
    /// `false`.
    pub fn remove(&self, id: &ConnectionId) -> bool {
        let mut sessions = self.sessions.write();
        let removed = sessions.remove(id).is_some();
        if removed {
            debug!(connection = %id, total = sessions.len(), "Session deregistered");
        }
        removed
    }

    /// Check whether a session is registered.
    #[must_use]
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.sessions.read().contains_key(id)
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Check if no session is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Copy of the registered sessions at this instant.
    ///
    /// The copy is independent of the registry, so callers can iterate and
    /// send without holding the lock.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SessionHandle> {
        self.sessions.read().values().cloned().collect()
    }
}
