//! Tracks open client sessions.

use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::engine::SessionId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub user: Option<String>,
}

#[derive(Debug)]
pub struct SessionTable {
    next_id: AtomicU32,
    sessions: Mutex<HashMap<SessionId, Session>>,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

impl SessionTable {
    pub fn new() -> Self {
        Default::default()
    }

    /// Opens a new session and returns its id.  Ids are never reused.
    pub fn open(&self, user: Option<String>) -> Option<SessionId> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut sessions = self.sessions.lock().ok()?;
        debug!("Opened session {} for user {:?}", id, user);
        sessions.insert(id, Session { id, user });
        Some(id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions
            .lock()
            .map(|sessions| sessions.contains_key(&id))
            .unwrap_or(false)
    }

    /// Forgets the session.  Returns it if it was open.
    pub fn close(&self, id: SessionId) -> Option<Session> {
        let closed = self.sessions.lock().ok()?.remove(&id);
        if closed.is_some() {
            debug!("Closed session {}", id);
        }
        closed
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn open_close() {
        let table = SessionTable::new();
        let a = table.open(Some("admin".to_string())).unwrap();
        let b = table.open(None).unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert!(table.contains(a));
        assert!(table.contains(b));

        let closed = table.close(a).unwrap();
        assert_eq!(closed.user.as_deref(), Some("admin"));
        assert!(!table.contains(a));
        assert!(table.close(a).is_none());

        // Ids aren't reused.
        assert_eq!(table.open(None).unwrap(), 3);
    }
}
