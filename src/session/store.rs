use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

use super::Session;

/// All sessions known to the broker, keyed by client id
#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<Arc<str>, Arc<Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(client_id).map(|s| s.clone())
    }

    /// Insert a session, returning the one it replaced
    pub fn insert(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        self.sessions.insert(session.id().clone(), session)
    }

    pub fn remove(&self, client_id: &str) -> Option<Arc<Session>> {
        self.sessions.remove(client_id).map(|(_, s)| s)
    }

    /// Remove only if the stored session is `session` itself, so a
    /// connection that lost a takeover race cannot delete its successor
    pub fn remove_if_same(&self, session: &Session) -> bool {
        self.sessions
            .remove_if(session.id(), |_, current| std::ptr::eq(Arc::as_ptr(current), session))
            .is_some()
    }

    /// Remove and return every session whose expiry has elapsed
    pub fn take_expired(&self, now: Instant) -> Vec<Arc<Session>> {
        let expired: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.value().clone())
            .collect();
        expired
            .into_iter()
            .filter(|s| self.remove_if_same(s))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
