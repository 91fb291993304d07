//! Session persistence: one versioned JSON record per session.
//!
//!   sessions/active/{id}.json     non-terminal sessions
//!   sessions/completed/{id}.json  completed, failed, cancelled
//!
//! A record lives in exactly one of the two directories. Saving a session
//! writes it where its status belongs and removes any copy from the other.

use std::fs;
use std::path::{Path, PathBuf};

use ferry_core::model::TransferSession;
use ferry_core::record;

use crate::chunk_store::{validate_file_id, write_atomic, StoreError};

pub struct SessionStore {
    active: PathBuf,
    completed: PathBuf,
}

impl SessionStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let store = Self {
            active: root.join("active"),
            completed: root.join("completed"),
        };
        for dir in [&store.active, &store.completed] {
            fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
        }
        Ok(store)
    }

    fn record_name(id: &str) -> Result<String, StoreError> {
        validate_file_id(id)?;
        Ok(format!("{id}.json"))
    }

    pub fn save(&self, session: &TransferSession) -> Result<(), StoreError> {
        let name = Self::record_name(&session.id)?;
        let (home, other) = if session.status.is_terminal() {
            (&self.completed, &self.active)
        } else {
            (&self.active, &self.completed)
        };

        write_atomic(&home.join(&name), &record::encode(session)?)?;

        let stale = other.join(&name);
        match fs::remove_file(&stale) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(&stale, e)),
        }
        Ok(())
    }

    /// Delete a session record. Returns false when there was none.
    pub fn remove(&self, id: &str) -> bool {
        let Ok(name) = Self::record_name(id) else {
            return false;
        };
        let mut removed = false;
        for dir in [&self.active, &self.completed] {
            let path = dir.join(&name);
            match fs::remove_file(&path) {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "failed to remove session record")
                }
            }
        }
        removed
    }

    /// Every readable record, active first. Unreadable ones are logged
    /// and skipped.
    pub fn load_all(&self) -> Vec<TransferSession> {
        let mut sessions = load_dir(&self.active);
        sessions.extend(load_dir(&self.completed));
        sessions
    }
}

fn load_dir(dir: &Path) -> Vec<TransferSession> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(error = %e, path = %dir.display(), "failed to list session records");
            return Vec::new();
        }
    };

    let mut sessions = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().map_or(true, |ext| ext != "json") {
            continue;
        }
        let parsed = fs::read(&path)
            .map_err(|e| StoreError::io(&path, e))
            .and_then(|bytes| record::decode::<TransferSession>(&bytes).map_err(StoreError::from));
        match parsed {
            Ok(session) => sessions.push(session),
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "skipping unreadable session record")
            }
        }
    }
    sessions
}
