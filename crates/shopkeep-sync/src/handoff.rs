//! Consume-once values passed across a navigation boundary.
//!
//! One view stores a value (the chat to resume, a product to preselect) and
//! the next view takes it. Taking removes the value and persists the removal
//! before returning, so a restart never replays it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::SyncError;

/// Chat to reopen when the inbox is next shown.
pub const RESUME_CHAT: &str = "resume_chat";
/// Product to preselect in the catalog view.
pub const SELECTED_PRODUCT: &str = "selected_product";

#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<HandoffError> for SyncError {
    fn from(err: HandoffError) -> Self {
        SyncError::Handoff(err.to_string())
    }
}

/// File-backed key/value side channel, stored as a JSON object.
pub struct Handoff {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl Handoff {
    /// Open the channel at `path`. A missing file is an empty channel.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, HandoffError> {
        let path = path.into();
        let values = load(&path)?;
        debug!(path = %path.display(), entries = values.len(), "handoff: opened");
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Store `value` under `key`, replacing any unread value.
    pub fn put(&self, key: &str, value: impl Into<String>) -> Result<(), HandoffError> {
        let mut values = self.values.lock();
        values.insert(key.to_string(), value.into());
        save(&self.path, &values)
    }

    /// Read and remove the value under `key`.
    ///
    /// The removal is written to disk before the value is returned; if that
    /// write fails the value stays in place and the error is returned.
    pub fn take(&self, key: &str) -> Result<Option<String>, HandoffError> {
        let mut values = self.values.lock();
        let Some(value) = values.remove(key) else {
            return Ok(None);
        };
        if let Err(err) = save(&self.path, &values) {
            warn!(key, error = %err, "handoff: failed to persist removal");
            values.insert(key.to_string(), value);
            return Err(err);
        }
        debug!(key, "handoff: consumed");
        Ok(Some(value))
    }

    /// Read the value under `key` without consuming it.
    pub fn peek(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }
}

fn load(path: &Path) -> Result<BTreeMap<String, String>, HandoffError> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let contents = std::fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    Ok(serde_json::from_str(&contents)?)
}

fn save(path: &Path, values: &BTreeMap<String, String>) -> Result<(), HandoffError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let contents = serde_json::to_string_pretty(values)?;
    std::fs::write(path, contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_take_returns_value_once() {
        let dir = TempDir::new().unwrap();
        let handoff = Handoff::open(dir.path().join("handoff.json")).unwrap();

        handoff.put(RESUME_CHAT, "chat-1").unwrap();
        assert_eq!(handoff.peek(RESUME_CHAT).as_deref(), Some("chat-1"));
        assert_eq!(handoff.take(RESUME_CHAT).unwrap().as_deref(), Some("chat-1"));
        assert_eq!(handoff.take(RESUME_CHAT).unwrap(), None);
    }

    #[test]
    fn test_consumption_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("handoff.json");

        let handoff = Handoff::open(&path).unwrap();
        handoff.put(RESUME_CHAT, "chat-1").unwrap();
        handoff.put(SELECTED_PRODUCT, "sku-42").unwrap();
        drop(handoff);

        let reopened = Handoff::open(&path).unwrap();
        assert_eq!(reopened.take(RESUME_CHAT).unwrap().as_deref(), Some("chat-1"));
        drop(reopened);

        let again = Handoff::open(&path).unwrap();
        assert_eq!(again.take(RESUME_CHAT).unwrap(), None);
        assert_eq!(again.peek(SELECTED_PRODUCT).as_deref(), Some("sku-42"));
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("handoff.json");
        std::fs::write(&path, "not json").unwrap();

        let err = Handoff::open(&path).err().unwrap();
        assert!(matches!(err, HandoffError::Serde(_)));
        assert!(matches!(SyncError::from(err), SyncError::Handoff(_)));
    }
}
