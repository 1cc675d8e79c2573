//! Persisted sync cursors, one per canonical source calendar.
//!
//! Stored as `{ "syncTokens": { "<calendarId>": "<opaque token>" } }`.
//! A missing entry means the next fetch for that source is a windowed
//! full resync.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{MirrorError, MirrorResult};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    #[serde(rename = "syncTokens", default)]
    pub sync_tokens: BTreeMap<String, String>,
}

pub struct SyncStateStore {
    path: PathBuf,
    persist: bool,
    state: SyncState,
}

impl SyncStateStore {
    /// Load state from `path`. A missing or unreadable file starts empty.
    /// With `persist` off nothing is read or written.
    pub fn load(path: impl Into<PathBuf>, persist: bool) -> Self {
        let path = path.into();

        let state = if persist {
            match Self::read(&path) {
                Ok(Some(state)) => state,
                Ok(None) => {
                    info!(path = %path.display(), "no sync state yet, sources will resync their window");
                    SyncState::default()
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ignoring unreadable sync state");
                    SyncState::default()
                }
            }
        } else {
            SyncState::default()
        };

        SyncStateStore {
            path,
            persist,
            state,
        }
    }

    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        SyncStateStore {
            path: PathBuf::new(),
            persist: false,
            state: SyncState::default(),
        }
    }

    fn read(path: &Path) -> MirrorResult<Option<SyncState>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        let state = serde_json::from_str(&content)
            .map_err(|e| MirrorError::State(format!("{}: {e}", path.display())))?;
        Ok(Some(state))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn cursor(&self, calendar_id: &str) -> Option<&str> {
        self.state.sync_tokens.get(calendar_id).map(String::as_str)
    }

    /// Replace the cursor for a source and persist immediately.
    pub fn set_cursor(&mut self, calendar_id: &str, token: &str) {
        self.state
            .sync_tokens
            .insert(calendar_id.to_string(), token.to_string());
        self.persist();
    }

    pub fn clear_cursor(&mut self, calendar_id: &str) {
        if self.state.sync_tokens.remove(calendar_id).is_some() {
            self.persist();
        }
    }

    /// Forget every cursor.
    pub fn reset_all(&mut self) {
        self.state.sync_tokens.clear();
        self.persist();
    }

    /// Forget the cursors of the given sources.
    pub fn reset<S: AsRef<str>>(&mut self, calendar_ids: &[S]) {
        let mut changed = false;
        for id in calendar_ids {
            changed |= self.state.sync_tokens.remove(id.as_ref()).is_some();
        }
        if changed {
            self.persist();
        }
    }

    /// Write failures are logged; losing a cursor only costs a resync.
    fn persist(&self) {
        if !self.persist {
            return;
        }
        match self.save() {
            Ok(()) => debug!(path = %self.path.display(), "sync state saved"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "sync state write failed"),
        }
    }

    pub fn save(&self) -> MirrorResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(&self.state)
            .map_err(|e| MirrorError::Serialization(e.to_string()))?;

        let mut temp = self.path.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);

        std::fs::write(&temp, content)?;
        std::fs::rename(&temp, &self.path)?;
        Ok(())
    }
}
