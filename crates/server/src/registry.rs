//! Thread-safe registry of live sessions.
//!
//! Sessions are keyed by identity, not username: routing for chat and
//! presence walks the registry for the first authenticated session carrying
//! a name, so usernames are not guaranteed unique among live sessions.

use std::sync::Arc;

use dashmap::DashMap;

use crate::session::{Session, SessionId};

/// Concurrent map of all connected sessions.
///
/// The sweeper iterates a snapshot of ids each tick while handler tasks may
/// remove dead sessions concurrently.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted session.
    pub fn insert(&self, session: Arc<Session>) {
        self.sessions.insert(session.id(), session);
    }

    /// Remove a session, returning it if it was still registered.
    pub fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    /// Look a session up by id.
    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(&entry))
    }

    /// Snapshot of live session ids. The sweep iterates this copy so
    /// concurrent removals never invalidate the scan.
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| entry.id()).collect()
    }

    /// First authenticated session bound to the given username.
    pub fn find_by_username(&self, username: &str) -> Option<Arc<Session>> {
        self.sessions.iter().find_map(|entry| {
            (entry.username().as_deref() == Some(username)).then(|| Arc::clone(&entry))
        })
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are connected.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn session() -> Arc<Session> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        Arc::new(Session::new(stream, peer))
    }

    #[tokio::test]
    async fn test_insert_get_remove() {
        let registry = SessionRegistry::new();
        let s = session().await;
        let id = s.id();

        registry.insert(Arc::clone(&s));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&id).is_some());

        assert!(registry.remove(&id).is_some());
        assert!(registry.is_empty());
        assert!(registry.remove(&id).is_none());
    }

    #[tokio::test]
    async fn test_find_by_username_requires_authentication() {
        let registry = SessionRegistry::new();
        let s = session().await;
        registry.insert(Arc::clone(&s));

        assert!(registry.find_by_username("alice").is_none());

        s.bind_username("alice");
        let found = registry.find_by_username("alice").unwrap();
        assert_eq!(found.id(), s.id());
        assert!(registry.find_by_username("bob").is_none());
    }

    #[tokio::test]
    async fn test_ids_snapshot_survives_removal() {
        let registry = SessionRegistry::new();
        let a = session().await;
        let b = session().await;
        registry.insert(Arc::clone(&a));
        registry.insert(Arc::clone(&b));

        let snapshot = registry.ids();
        assert_eq!(snapshot.len(), 2);

        // Removing mid-scan leaves the snapshot intact; lookups just miss.
        registry.remove(&a.id());
        let live: Vec<_> = snapshot
            .iter()
            .filter_map(|id| registry.get(id))
            .collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id(), b.id());
    }
}
