//! Process-wide table of active sessions.
//!
//! The registry is mutated by session creation, explicit deletion, and the
//! sweep job. Mutations take a short write lock; enumeration always works on
//! a point-in-time snapshot so a sweep never races a concurrent delete.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use super::{Session, SessionError, SessionId, SessionState};

/// Shared map of active sessions keyed by session id.
///
/// Cheap to clone; all clones observe the same underlying map.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<SessionId, Session>>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new session.
    ///
    /// # Errors
    /// - `SessionError::DuplicateSession` - A session with this id exists
    pub fn insert(&self, session: Session) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&session.id) {
            return Err(SessionError::DuplicateSession {
                id: session.id.clone(),
            });
        }
        tracing::info!(session = %session.id, r#type = %session.stream_type, "session registered");
        sessions.insert(session.id.clone(), session);
        Ok(())
    }

    /// Removes a session, returning its record if it existed.
    ///
    /// Safe to call while a fetch for the session is in flight: the engine
    /// treats completions for a removed session as no-ops.
    pub fn remove(&self, id: &SessionId) -> Option<Session> {
        let removed = self.sessions.write().remove(id);
        if removed.is_some() {
            tracing::info!(session = %id, "session removed");
        }
        removed
    }

    /// Returns a clone of the session record, if present.
    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.sessions.read().get(id).cloned()
    }

    /// Whether a session with this id exists.
    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.read().contains_key(id)
    }

    /// Transitions a session into the terminal `Stopped` state.
    ///
    /// Returns false if the session no longer exists.
    pub fn mark_stopped(&self, id: &SessionId) -> bool {
        match self.sessions.write().get_mut(id) {
            Some(session) => {
                session.state = SessionState::Stopped;
                true
            }
            None => false,
        }
    }

    /// Transitions a session into `Running`.
    pub fn mark_running(&self, id: &SessionId) -> bool {
        match self.sessions.write().get_mut(id) {
            Some(session) => {
                session.state = SessionState::Running;
                true
            }
            None => false,
        }
    }

    /// Sets the stream type once the first manifest parse reveals it.
    pub fn set_stream_type(&self, id: &SessionId, stream_type: super::StreamType) {
        if let Some(session) = self.sessions.write().get_mut(id) {
            session.stream_type = stream_type;
        }
    }

    /// Records manifest metadata discovered after a successful parse.
    pub fn record_manifest_meta(
        &self,
        id: &SessionId,
        min_buffer_time: Option<Duration>,
        media_duration: Option<Duration>,
    ) {
        if let Some(session) = self.sessions.write().get_mut(id) {
            session.min_buffer_time = min_buffer_time;
            session.media_duration = media_duration;
        }
    }

    /// Returns a point-in-time snapshot of all sessions.
    ///
    /// The sweep job iterates this snapshot, never the live map.
    pub fn snapshot(&self) -> Vec<Session> {
        self.sessions.read().values().cloned().collect()
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::StreamType;

    fn session(id: &str) -> Session {
        Session::new(
            SessionId::new(id),
            StreamType::Live,
            "http://origin/live.mpd",
            "/tmp/out/live.mpd",
        )
    }

    #[test]
    fn test_insert_rejects_duplicate_id() {
        let registry = SessionRegistry::new();
        registry.insert(session("a")).unwrap();

        let result = registry.insert(session("a"));
        assert!(matches!(
            result,
            Err(SessionError::DuplicateSession { .. })
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = SessionRegistry::new();
        registry.insert(session("a")).unwrap();

        assert!(registry.remove(&SessionId::new("a")).is_some());
        assert!(registry.remove(&SessionId::new("a")).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_mark_stopped_keeps_record_queryable() {
        let registry = SessionRegistry::new();
        registry.insert(session("a")).unwrap();

        assert!(registry.mark_stopped(&SessionId::new("a")));
        let record = registry.get(&SessionId::new("a")).unwrap();
        assert_eq!(record.state, SessionState::Stopped);
    }

    #[test]
    fn test_snapshot_is_detached_from_live_map() {
        let registry = SessionRegistry::new();
        registry.insert(session("a")).unwrap();
        registry.insert(session("b")).unwrap();

        let snapshot = registry.snapshot();
        registry.remove(&SessionId::new("a"));

        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_insert_and_remove() {
        let registry = SessionRegistry::new();
        let mut handles = Vec::new();

        for i in 0..8 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                let id = format!("s{i}");
                registry.insert(session(&id)).unwrap();
                registry.remove(&SessionId::new(id));
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(registry.is_empty());
    }
}
