//! Tracks the live set of sessions a single prefetch-helper process hosts
//! (§4.4's session id space: orchestrator-assigned `u32`, reuse forbidden
//! while the old session still exists).

use crate::session::Session;
use std::collections::HashMap;

#[derive(Default)]
pub struct SessionManager {
    sessions: HashMap<u32, Session>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if `session_id` is already live; the caller reports
    /// this back to the orchestrator as a protocol error.
    pub fn create_session(&mut self, session_id: u32, description: String) -> bool {
        if self.sessions.contains_key(&session_id) {
            return false;
        }
        self.sessions.insert(session_id, Session::new(session_id, description));
        true
    }

    pub fn get_mut(&mut self, session_id: u32) -> Option<&mut Session> {
        self.sessions.get_mut(&session_id)
    }

    /// Dropping the session implicitly unregisters every path it holds
    /// (`Session`'s `Drop` impl), matching §4.4's "implicit
    /// UnregisterFilePath for every registered path". Idempotent: destroying
    /// an already-gone session is not an error.
    pub fn destroy_session(&mut self, session_id: u32) -> bool {
        self.sessions.remove(&session_id).is_some()
    }

    pub fn dump_session(&self, session_id: u32) -> Option<String> {
        self.sessions.get(&session_id).map(Session::dump)
    }

    pub fn dump_everything(&self) -> String {
        let mut out = format!("SessionManager: {} live session(s)\n", self.sessions.len());
        let mut ids: Vec<&u32> = self.sessions.keys().collect();
        ids.sort();
        for id in ids {
            out.push_str(&self.sessions[id].dump());
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_session_rejects_duplicate_id() {
        let mut mgr = SessionManager::new();
        assert!(mgr.create_session(1, "a".to_string()));
        assert!(!mgr.create_session(1, "b".to_string()));
    }

    #[test]
    fn destroy_then_recreate_with_same_id_is_allowed() {
        let mut mgr = SessionManager::new();
        assert!(mgr.create_session(1, "a".to_string()));
        assert!(mgr.destroy_session(1));
        assert!(mgr.create_session(1, "b".to_string()));
    }

    #[test]
    fn destroy_is_idempotent() {
        let mut mgr = SessionManager::new();
        assert!(!mgr.destroy_session(42));
    }

    #[test]
    fn dump_session_absent_returns_none() {
        let mgr = SessionManager::new();
        assert!(mgr.dump_session(1).is_none());
    }
}
