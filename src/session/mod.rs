//! Client session tracking
//!
//! One [`ClientSession`] per connected client. The dispatcher owns the
//! records; everything else reads snapshots through [`SessionStore`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSession {
    pub id: SessionId,
    pub remote_address: String,
    pub authenticated: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub request_count: u64,
}

impl ClientSession {
    fn new(remote_address: String) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            remote_address,
            authenticated: false,
            created_at: now,
            last_activity_at: now,
            request_count: 0,
        }
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_activity_at).to_std().unwrap_or_default()
    }
}

/// Process-wide registry of live sessions.
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionId, ClientSession>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted connection.
    pub fn create(&self, remote_address: impl Into<String>) -> ClientSession {
        let session = ClientSession::new(remote_address.into());
        debug!(session_id = %session.id, remote = %session.remote_address, "Session created");
        self.write().insert(session.id, session.clone());
        session
    }

    pub fn get(&self, id: SessionId) -> Option<ClientSession> {
        self.read().get(&id).cloned()
    }

    /// Record an inbound message: bumps the activity timestamp and, for
    /// requests, the request counter. Returns the updated snapshot.
    pub fn touch(&self, id: SessionId, is_request: bool) -> Option<ClientSession> {
        let mut sessions = self.write();
        let session = sessions.get_mut(&id)?;
        session.last_activity_at = Utc::now();
        if is_request {
            session.request_count += 1;
        }
        Some(session.clone())
    }

    /// Sessions never go back to unauthenticated.
    pub fn mark_authenticated(&self, id: SessionId) -> Option<ClientSession> {
        let mut sessions = self.write();
        let session = sessions.get_mut(&id)?;
        session.authenticated = true;
        Some(session.clone())
    }

    pub fn remove(&self, id: SessionId) -> Option<ClientSession> {
        let removed = self.write().remove(&id);
        if removed.is_some() {
            debug!(session_id = %id, "Session removed");
        }
        removed
    }

    pub fn active_count(&self) -> usize {
        self.read().len()
    }

    pub fn list(&self) -> Vec<ClientSession> {
        let mut sessions: Vec<_> = self.read().values().cloned().collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    /// Drop every session idle longer than `max_idle`.
    pub fn remove_idle(&self, max_idle: Duration) -> Vec<SessionId> {
        let now = Utc::now();
        let mut sessions = self.write();
        let expired: Vec<SessionId> = sessions
            .values()
            .filter(|s| s.idle_for(now) > max_idle)
            .map(|s| s.id)
            .collect();
        for id in &expired {
            sessions.remove(id);
        }
        expired
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<SessionId, ClientSession>> {
        self.sessions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<SessionId, ClientSession>> {
        self.sessions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
