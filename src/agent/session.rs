//! Agent session tracking.
//!
//! The Full-weight executor resumes the agent's conversation across
//! iterations via `--resume <session-id>`. The session manager maps task
//! ids to the last session id the agent reported, bound to one working
//! directory; on a worktree switch the driver replaces the whole manager
//! so stale sessions from the old checkout are never resumed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub struct SessionManager {
    work_dir: PathBuf,
    sessions: Mutex<HashMap<String, String>>,
}

impl SessionManager {
    pub fn new(work_dir: &Path) -> Self {
        Self {
            work_dir: work_dir.to_path_buf(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// The resumable session for a task, if one was recorded.
    pub fn get(&self, task_id: &str) -> Option<String> {
        self.sessions.lock().unwrap().get(task_id).cloned()
    }

    /// Record the session id the agent reported for a task.
    pub fn record(&self, task_id: &str, session_id: &str) {
        if session_id.is_empty() {
            return;
        }
        self.sessions
            .lock()
            .unwrap()
            .insert(task_id.to_string(), session_id.to_string());
    }

    /// Drop a task's session (e.g. after a retry back-jump resets context).
    pub fn clear(&self, task_id: &str) {
        self.sessions.lock().unwrap().remove(task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_get() {
        let mgr = SessionManager::new(Path::new("/tmp/work"));
        assert!(mgr.get("T-1").is_none());

        mgr.record("T-1", "sess-abc");
        assert_eq!(mgr.get("T-1").as_deref(), Some("sess-abc"));

        // Later session replaces the earlier one
        mgr.record("T-1", "sess-def");
        assert_eq!(mgr.get("T-1").as_deref(), Some("sess-def"));
    }

    #[test]
    fn test_empty_session_id_ignored() {
        let mgr = SessionManager::new(Path::new("/tmp/work"));
        mgr.record("T-1", "");
        assert!(mgr.get("T-1").is_none());
    }

    #[test]
    fn test_clear() {
        let mgr = SessionManager::new(Path::new("/tmp/work"));
        mgr.record("T-1", "sess-abc");
        mgr.clear("T-1");
        assert!(mgr.get("T-1").is_none());
    }
}
