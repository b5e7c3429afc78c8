//! Completed-session persistence.
//!
//! The pipeline hands every finalized session, recap included, to a
//! [`SessionStore`]. The JSON store writes one document per session, the
//! way the app keeps its other user-facing records; the memory store backs
//! tests and hosts that persist elsewhere.

use crate::error::LiveCallError;
use crate::recap::SessionRecap;
use log::{debug, warn};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

pub trait SessionStore: Send + Sync {
    fn save_completed_session(&self, record: &SessionRecap) -> Result<(), LiveCallError>;
}

/// One JSON document per completed session, named by session id.
pub struct JsonSessionStore {
    dir: PathBuf,
}

impl JsonSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Load every stored session, newest first. Unreadable documents are
    /// skipped with a warning rather than failing the whole listing.
    pub fn load_all(&self) -> Result<Vec<SessionRecap>, LiveCallError> {
        let mut sessions = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(sessions),
            Err(err) => return Err(LiveCallError::Persistence(err.to_string())),
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|text| serde_json::from_str::<SessionRecap>(&text).map_err(|e| e.to_string()))
            {
                Ok(record) => sessions.push(record),
                Err(err) => warn!("Skipping unreadable session file {:?}: {}", path, err),
            }
        }

        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(sessions)
    }
}

impl SessionStore for JsonSessionStore {
    fn save_completed_session(&self, record: &SessionRecap) -> Result<(), LiveCallError> {
        fs::create_dir_all(&self.dir).map_err(|e| LiveCallError::Persistence(e.to_string()))?;

        let path = self.dir.join(format!("{}.json", record.session_id));
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| LiveCallError::Persistence(e.to_string()))?;
        fs::write(&path, json).map_err(|e| LiveCallError::Persistence(e.to_string()))?;

        debug!("Saved session {} to {:?}", record.session_id, path);
        Ok(())
    }
}

/// In-memory store.
pub struct MemorySessionStore {
    sessions: Mutex<Vec<SessionRecap>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn sessions(&self) -> Vec<SessionRecap> {
        self.sessions.lock().unwrap().clone()
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore for MemorySessionStore {
    fn save_completed_session(&self, record: &SessionRecap) -> Result<(), LiveCallError> {
        self.sessions.lock().unwrap().push(record.clone());
        Ok(())
    }
}
