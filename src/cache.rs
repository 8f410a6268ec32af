//! Content-addressed result cache.
//!
//! Entries live in memory and are mirrored to one JSON file per key, so a
//! restarted daemon keeps its hits. Keys are built only from stable
//! identifiers (a video id, the hash of an image) so that retries and
//! duplicate events converge on the same entry. Expired entries are removed
//! lazily when looked up.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::utils::{get_utc_timestamp_ms, sha256_hex, write_atomic};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Hashed cache key derived from `namespace:id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(namespace: &str, id: &str) -> Self {
        Self(sha256_hex(format!("{namespace}:{id}").as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    /// UTC milliseconds
    pub created_at: i64,
    pub ttl_ms: u64,
}

impl CacheEntry {
    fn is_expired(&self, now_ms: i64) -> bool {
        let ttl_ms = self.ttl_ms.min(i64::MAX as u64) as i64;
        now_ms.saturating_sub(self.created_at) >= ttl_ms
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

#[derive(Debug)]
pub struct ResultCache {
    /// `None` keeps the cache in memory only.
    dir: Option<PathBuf>,
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    /// Cache persisted under `dir`, created if missing.
    pub fn open(dir: impl Into<PathBuf>) -> CacheResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir: Some(dir),
            ..Self::in_memory()
        })
    }

    pub fn in_memory() -> Self {
        Self {
            dir: None,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn entry_path(&self, key: &CacheKey) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", key.as_str())))
    }

    /// Look up `key`. Expired or unreadable entries count as misses.
    pub fn get(&self, key: &CacheKey) -> Option<Value> {
        let now = get_utc_timestamp_ms();

        let mut cached = self.entries.lock().get(key).cloned();
        if cached.is_none() {
            cached = self.entry_path(key).and_then(|p| read_entry(&p));
        }

        let value = match cached {
            Some(entry) if entry.is_expired(now) => {
                self.entries.lock().remove(key);
                if let Some(path) = self.entry_path(key) {
                    let _ = std::fs::remove_file(path);
                }
                None
            }
            Some(entry) => {
                let value = entry.value.clone();
                self.entries.lock().entry(key.clone()).or_insert(entry);
                Some(value)
            }
            None => None,
        };

        match value {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        value
    }

    /// Store `value` under `key` for `ttl`.
    ///
    /// The file is written (and synced) before the lock is taken; call from
    /// a blocking context when running on the async runtime.
    pub fn set(&self, key: &CacheKey, value: Value, ttl: Duration) -> CacheResult<()> {
        let entry = CacheEntry {
            key: key.as_str().to_string(),
            value,
            created_at: get_utc_timestamp_ms(),
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
        };

        if let Some(path) = self.entry_path(key) {
            write_atomic(&path, &serde_json::to_vec(&entry)?)?;
        }
        self.entries.lock().insert(key.clone(), entry);
        Ok(())
    }

    /// Remove every expired entry from memory and disk. Returns how many went.
    pub fn purge_expired(&self) -> CacheResult<usize> {
        let now = get_utc_timestamp_ms();
        let mut removed = HashSet::new();

        let mut entries = self.entries.lock();
        entries.retain(|key, e| {
            if e.is_expired(now) {
                removed.insert(key.clone());
                false
            } else {
                true
            }
        });

        if let Some(dir) = &self.dir {
            for dir_entry in std::fs::read_dir(dir)? {
                let path = dir_entry?.path();
                if path.extension().is_none_or(|e| e != "json") {
                    continue;
                }
                let expired = match read_entry(&path) {
                    Some(entry) => entry.is_expired(now),
                    // Corrupt files are never going to hit
                    None => true,
                };
                if expired {
                    std::fs::remove_file(&path)?;
                    if let Some(key) = stem_key(&path) {
                        removed.insert(key);
                    }
                }
            }
        }

        Ok(removed.len())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.lock().len(),
        }
    }
}

fn read_entry(path: &Path) -> Option<CacheEntry> {
    let data = std::fs::read(path).ok()?;
    match serde_json::from_slice(&data) {
        Ok(entry) => Some(entry),
        Err(e) => {
            tracing::debug!("[cache] ignoring unreadable entry {}: {e}", path.display());
            None
        }
    }
}

fn stem_key(path: &Path) -> Option<CacheKey> {
    path.file_stem()
        .map(|s| CacheKey(s.to_string_lossy().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_key_is_stable_and_namespaced() {
        assert_eq!(CacheKey::new("transcript", "abc123"), CacheKey::new("transcript", "abc123"));
        assert_ne!(CacheKey::new("transcript", "abc123"), CacheKey::new("vision", "abc123"));
        assert_eq!(CacheKey::new("transcript", "abc123").as_str().len(), 64);
    }

    #[test]
    fn test_get_after_set() {
        let cache = ResultCache::in_memory();
        let key = CacheKey::new("transcript", "abc123");
        assert!(cache.get(&key).is_none());

        cache.set(&key, json!({"quotes": 3}), HOUR).unwrap();
        assert_eq!(cache.get(&key), Some(json!({"quotes": 3})));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let key = CacheKey::new("vision", "deadbeef");

        ResultCache::open(dir.path())
            .unwrap()
            .set(&key, json!("Meeting notes"), HOUR)
            .unwrap();

        let reopened = ResultCache::open(dir.path()).unwrap();
        assert_eq!(reopened.get(&key), Some(json!("Meeting notes")));
    }

    #[test]
    fn test_expired_entry_is_removed_on_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        let key = CacheKey::new("embedding", "hash");

        cache.set(&key, json!([0.1, 0.2]), Duration::ZERO).unwrap();
        assert!(cache.get(&key).is_none());
        assert!(!dir.path().join(format!("{}.json", key.as_str())).exists());
    }

    #[test]
    fn test_sub_second_ttl_is_honoured() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        let key = CacheKey::new("vision", "short");

        cache.set(&key, json!("fresh"), Duration::from_millis(300)).unwrap();
        assert_eq!(cache.get(&key), Some(json!("fresh")));
        // A fresh instance reads the millisecond TTL from disk
        let reopened = ResultCache::open(dir.path()).unwrap();
        assert_eq!(reopened.get(&key), Some(json!("fresh")));

        std::thread::sleep(Duration::from_millis(350));
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn test_purge_expired() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        cache.set(&CacheKey::new("a", "1"), json!(1), Duration::ZERO).unwrap();
        cache.set(&CacheKey::new("a", "2"), json!(2), HOUR).unwrap();
        std::fs::write(dir.path().join("garbage.json"), "{not json").unwrap();

        assert_eq!(cache.purge_expired().unwrap(), 2);

        let remaining: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(remaining.len(), 1);
        assert_eq!(cache.get(&CacheKey::new("a", "2")), Some(json!(2)));
    }
}
