use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::error::StoreError;
use crate::settings::SettingsSnapshot;

/// Key under which the merged settings snapshot is stored.
pub const SNAPSHOT_KEY: &str = "busything-settings";

/// Minimal key/value persistence contract.  `put` must replace the whole
/// value in one step: a reader never observes a partially written blob.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// One JSON file per key inside a directory.  Writes go to a temp file that
/// is renamed over the target.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.dir)?;
        let target = self.path_for(key);
        let tmp = self.dir.join(format!(".{}.json.tmp", key));
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &target)?;
        debug!("store: wrote {:?} ({} bytes)", target, value.len());
        Ok(())
    }
}

/// In-memory store.  Clones share the same map.
#[derive(Clone, Default)]
pub struct MemoryStore {
    map: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let map = self.map.lock().unwrap_or_else(|p| p.into_inner());
        Ok(map.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut map = self.map.lock().unwrap_or_else(|p| p.into_inner());
        map.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Read the cached snapshot.  A corrupt blob is treated as absent so the
/// daemon still starts from defaults.
pub fn load_snapshot(store: &dyn KeyValueStore) -> Result<Option<SettingsSnapshot>, StoreError> {
    let Some(content) = store.get(SNAPSHOT_KEY)? else {
        return Ok(None);
    };
    match serde_json::from_str::<SettingsSnapshot>(&content) {
        Ok(snapshot) => Ok(Some(snapshot)),
        Err(e) => {
            warn!("store: ignoring unreadable settings cache: {}", e);
            Ok(None)
        }
    }
}

pub fn save_snapshot(store: &dyn KeyValueStore, snapshot: &SettingsSnapshot) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(snapshot)?;
    store.put(SNAPSHOT_KEY, &json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, Registry};

    #[test]
    fn test_file_store_missing_key_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        assert!(store.get("absent").unwrap().is_none());
    }

    #[test]
    fn test_file_store_replaces_value() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("nested"));
        store.put("k", "first").unwrap();
        store.put("k", "second").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("second"));
        // temp file must not linger after the rename
        assert!(!dir.path().join("nested").join(".k.json.tmp").exists());
    }

    #[test]
    fn test_snapshot_survives_store() {
        let store = MemoryStore::new();
        let mut channels = Registry::new();
        channels.upsert(Channel::new("slack", "slack.mp3", 4000, 0.7)).unwrap();
        let snapshot = SettingsSnapshot {
            channels,
            ..Default::default()
        };
        save_snapshot(&store, &snapshot).unwrap();
        assert_eq!(load_snapshot(&store).unwrap(), Some(snapshot));
    }

    #[test]
    fn test_corrupt_cache_is_ignored() {
        let store = MemoryStore::new();
        store.put(SNAPSHOT_KEY, "{not json").unwrap();
        assert!(load_snapshot(&store).unwrap().is_none());
    }
}
