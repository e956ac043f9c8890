//! # Result Cache
//!
//! Durable URL → transcript mapping. Lookups hit an in-memory map; every
//! change is mirrored to a `CacheStore` so results survive restarts.
//!
//! ## Rules:
//! - Only complete, non-empty transcripts are stored
//! - A later `put` for the same URL overwrites the earlier one
//! - `clear` empties memory and the durable copy under one write lock
//! - A missing durable file is an empty cache; a corrupt one is logged and
//!   treated the same way

use crate::config::CacheConfig;
use crate::error::DispatchError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

type Entries = HashMap<String, String>;

/// Where cache contents are persisted.
pub trait CacheStore: Send + Sync {
    fn load(&self) -> Result<Entries, DispatchError>;
    fn save(&self, entries: &Entries) -> Result<(), DispatchError>;
    fn clear(&self) -> Result<(), DispatchError>;
    fn describe(&self) -> String;
}

/// A JSON object in `{data_dir}/{storage_key}.json`.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(data_dir: impl AsRef<Path>, storage_key: &str) -> Self {
        Self {
            path: data_dir.as_ref().join(format!("{}.json", storage_key)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CacheStore for FileStore {
    fn load(&self) -> Result<Entries, DispatchError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Entries::new()),
            Err(e) => return Err(DispatchError::Storage(format!("read {}: {}", self.path.display(), e))),
        };

        match serde_json::from_str(&raw) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Cache file is corrupt, starting empty");
                Ok(Entries::new())
            }
        }
    }

    fn save(&self, entries: &Entries) -> Result<(), DispatchError> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| DispatchError::Storage(format!("create {}: {}", dir.display(), e)))?;
        }

        let json = serde_json::to_string(entries).map_err(|e| DispatchError::Storage(e.to_string()))?;

        // Write a sibling then rename so readers never see half a file
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| DispatchError::Storage(format!("write {}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| DispatchError::Storage(format!("rename {}: {}", self.path.display(), e)))
    }

    fn clear(&self) -> Result<(), DispatchError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DispatchError::Storage(format!("remove {}: {}", self.path.display(), e))),
        }
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Non-durable store, used when persistence is disabled.
#[derive(Default)]
pub struct MemoryStore {
    saved: Mutex<Entries>,
}

impl CacheStore for MemoryStore {
    fn load(&self) -> Result<Entries, DispatchError> {
        Ok(self.saved.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn save(&self, entries: &Entries) -> Result<(), DispatchError> {
        *self.saved.lock().unwrap_or_else(PoisonError::into_inner) = entries.clone();
        Ok(())
    }

    fn clear(&self) -> Result<(), DispatchError> {
        self.saved.lock().unwrap_or_else(PoisonError::into_inner).clear();
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

pub struct ResultCache {
    entries: RwLock<Entries>,
    store: Box<dyn CacheStore>,
}

impl ResultCache {
    /// Open a cache over `store`, loading whatever it already holds.
    pub fn open(store: Box<dyn CacheStore>) -> Self {
        let entries = match store.load() {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(store = %store.describe(), error = %e, "Could not load cache, starting empty");
                Entries::new()
            }
        };

        tracing::info!(store = %store.describe(), entries = entries.len(), "Result cache opened");
        Self {
            entries: RwLock::new(entries),
            store,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        if config.enabled {
            Self::open(Box::new(FileStore::new(&config.data_dir, &config.storage_key)))
        } else {
            Self::open(Box::<MemoryStore>::default())
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Store a transcript. Empty values are never cached.
    ///
    /// The in-memory entry stays even when persisting fails; the error is
    /// returned so the caller can log it.
    pub fn put(&self, key: &str, value: &str) -> Result<(), DispatchError> {
        if value.is_empty() {
            tracing::debug!(key = %key, "Refusing to cache an empty transcript");
            return Ok(());
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        self.store.save(&entries)
    }

    pub fn clear(&self) -> Result<(), DispatchError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let removed = entries.len();
        entries.clear();
        self.store.clear()?;

        tracing::info!(removed, "Result cache cleared");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_entries_survive_reopen() {
        let dir = tempdir().unwrap();

        let cache = ResultCache::open(Box::new(FileStore::new(dir.path(), "transcriptions")));
        cache.put("https://x/a.mp3", "hello").unwrap();
        cache.put("https://x/a.mp3", "hello again").unwrap();
        drop(cache);

        let reopened = ResultCache::open(Box::new(FileStore::new(dir.path(), "transcriptions")));
        assert_eq!(reopened.get("https://x/a.mp3").as_deref(), Some("hello again"));
        assert_eq!(reopened.len(), 1);
        assert!(dir.path().join("transcriptions.json").exists());
        assert!(!dir.path().join("transcriptions.json.tmp").exists());
    }

    #[test]
    fn test_clear_removes_everything() {
        let dir = tempdir().unwrap();
        let cache = ResultCache::open(Box::new(FileStore::new(dir.path(), "t")));
        cache.put("a", "1").unwrap();
        cache.put("b", "2").unwrap();

        cache.clear().unwrap();
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_none());
        assert!(cache.is_empty());

        let reopened = ResultCache::open(Box::new(FileStore::new(dir.path(), "t")));
        assert!(reopened.get("a").is_none());
    }

    #[test]
    fn test_empty_values_are_not_cached() {
        let cache = ResultCache::open(Box::<MemoryStore>::default());
        cache.put("https://x/silence.wav", "").unwrap();
        assert!(cache.get("https://x/silence.wav").is_none());
    }

    #[test]
    fn test_missing_or_corrupt_file_is_empty() {
        let dir = tempdir().unwrap();
        assert!(ResultCache::open(Box::new(FileStore::new(dir.path(), "absent"))).is_empty());

        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        let cache = ResultCache::open(Box::new(FileStore::new(dir.path(), "broken")));
        assert!(cache.is_empty());

        // The next write replaces the corrupt file
        cache.put("k", "v").unwrap();
        let reopened = ResultCache::open(Box::new(FileStore::new(dir.path(), "broken")));
        assert_eq!(reopened.get("k").as_deref(), Some("v"));
    }

    #[test]
    fn test_storage_key_names_the_file() {
        let store = FileStore::new("/var/lib/clips", "transcriptions");
        assert_eq!(store.path(), Path::new("/var/lib/clips/transcriptions.json"));
    }
}
