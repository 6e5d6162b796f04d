//! Registry of live client sessions.
//!
//! The only state shared across sessions. Every operation takes the lock for
//! the duration of a single map operation, and iteration always happens over
//! a snapshot so broadcasts never hold the lock while delivering.

use crate::session::{ClientSession, ConnId};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

#[derive(Default)]
struct Members {
    sessions: HashMap<ConnId, Arc<ClientSession>>,
    /// Set once by `close_all`; no admissions afterwards.
    closed: bool,
}

/// Thread-safe set of sessions eligible for broadcast.
#[derive(Default)]
pub struct ConnectionRegistry {
    members: RwLock<Members>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session. Inserting the same connection twice is a no-op.
    ///
    /// Returns false when the session was not admitted: it is already
    /// closed, or the registry has been shut down. The caller owns closing
    /// a refused session.
    pub fn add(&self, session: Arc<ClientSession>) -> bool {
        let mut members = self.members.write().unwrap_or_else(PoisonError::into_inner);
        if members.closed || session.is_closed() {
            return false;
        }
        members.sessions.entry(session.conn_id()).or_insert(session);
        true
    }

    /// Remove a session if present. Never closes it.
    ///
    /// Returns whether this call removed it.
    pub fn remove(&self, session: &ClientSession) -> bool {
        let mut members = self.members.write().unwrap_or_else(PoisonError::into_inner);
        members.sessions.remove(&session.conn_id()).is_some()
    }

    /// Point-in-time copy of the current members.
    pub fn snapshot(&self) -> Vec<Arc<ClientSession>> {
        let members = self.members.read().unwrap_or_else(PoisonError::into_inner);
        members.sessions.values().cloned().collect()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        let members = self.members.read().unwrap_or_else(PoisonError::into_inner);
        members.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty the registry, close every member and refuse further adds.
    ///
    /// Returns how many sessions were closed by this call.
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut members = self.members.write().unwrap_or_else(PoisonError::into_inner);
            members.closed = true;
            members.sessions.drain().map(|(_, session)| session).collect()
        };

        let closed = drained.iter().filter(|session| session.close()).count();
        debug!(closed, "Closed all sessions");
        closed
    }
}
