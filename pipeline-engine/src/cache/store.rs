// Cache Manager
// On-disk artifact store: exact-key restore, atomic per-key saves, SIEVE + TTL eviction

use super::sieve::{CacheStats, SieveIndex};
use super::CacheError;
use crate::utils::{copy_tree, remove_path};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const META_FILE: &str = "meta.json";
const DATA_DIR: &str = "data";

/// Configuration for the cache store
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Store root (default: `<os cache dir>/cirun/cache`)
    pub root: PathBuf,
    /// Maximum number of entries kept
    pub capacity: usize,
    /// Entries older than this are treated as absent
    pub ttl: Option<Duration>,
}

impl CacheConfig {
    pub fn default_root() -> PathBuf {
        dirs::cache_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".cache")))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cirun")
            .join("cache")
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: Self::default_root(),
            capacity: 256,
            ttl: Some(Duration::from_secs(7 * 24 * 60 * 60)),
        }
    }
}

/// A stored cache entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    /// Directory holding the saved paths; item `i` is stored at `path/i`
    pub path: PathBuf,
    pub last_write: DateTime<Utc>,
    pub size_bytes: u64,
    /// Paths the entry was saved from
    pub sources: Vec<PathBuf>,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Option<Duration>, now: DateTime<Utc>) -> bool {
        match ttl.and_then(|ttl| chrono::Duration::from_std(ttl).ok()) {
            Some(ttl) => self.last_write + ttl < now,
            None => false,
        }
    }
}

struct State {
    index: SieveIndex<String>,
    entries: HashMap<String, CacheEntry>,
}

/// Keyed artifact store shared by concurrent jobs and across runs.
///
/// Restores match keys exactly. Saves to the same key are serialized by a
/// per-key async lock, copy into a staging area first and then rename into
/// place, so a reader never sees a partial entry.
pub struct CacheManager {
    config: CacheConfig,
    state: Mutex<State>,
    key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CacheManager {
    /// Open (or create) the store, rebuilding the index from disk oldest first
    pub fn open(config: CacheConfig) -> Result<Self, CacheError> {
        let mut index = SieveIndex::new(config.capacity)?;
        let entries_dir = config.root.join("entries");
        let staging_dir = config.root.join("staging");
        fs::create_dir_all(&entries_dir)?;

        // Leftovers of saves that never finished
        remove_path(&staging_dir)?;
        fs::create_dir_all(&staging_dir)?;

        let now = Utc::now();
        let mut loaded = Vec::new();
        for dir_entry in fs::read_dir(&entries_dir)? {
            let entry_dir = dir_entry?.path();
            match load_entry(&entry_dir) {
                Ok(entry) if entry.is_expired(config.ttl, now) => {
                    tracing::debug!(key = %entry.key, "dropping expired cache entry");
                    remove_path(&entry_dir)?;
                }
                Ok(entry) => loaded.push(entry),
                Err(e) => {
                    tracing::warn!(path = %entry_dir.display(), error = %e, "removing unreadable cache entry");
                    remove_path(&entry_dir)?;
                }
            }
        }

        loaded.sort_by_key(|e| e.last_write);
        let mut entries = HashMap::with_capacity(loaded.len());
        for entry in loaded {
            if let Some(victim) = index.insert(entry.key.clone()) {
                if let Some(evicted) = entries.remove(&victim) {
                    remove_entry_dir(&evicted);
                }
            }
            entries.insert(entry.key.clone(), entry);
        }

        tracing::debug!(
            root = %config.root.display(),
            entries = entries.len(),
            "opened cache store"
        );

        Ok(Self {
            config,
            state: Mutex::new(State { index, entries }),
            key_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.key_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(key.to_string()).or_default().clone()
    }

    fn entry_dir(&self, key: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        self.config.root.join("entries").join(digest)
    }

    /// Location of the stored copy for `key`. Exact match only; a miss or an
    /// expired entry yields `None`.
    ///
    /// For an entry saved from one path this is the copy of that path. For an
    /// entry saved from several paths it is the directory holding copy `i` of
    /// source `i` at `<dir>/i`.
    pub fn restore(&self, key: &str) -> Option<PathBuf> {
        self.lookup(key).map(|entry| stored_copy(&entry))
    }

    /// Find a live entry, dropping it first if it has expired
    fn lookup(&self, key: &str) -> Option<CacheEntry> {
        let mut state = self.state();
        let key_owned = key.to_string();

        let expired = state
            .entries
            .get(key)
            .map(|e| e.is_expired(self.config.ttl, Utc::now()))
            .unwrap_or(false);

        if expired {
            state.index.remove(&key_owned);
            if let Some(entry) = state.entries.remove(key) {
                remove_entry_dir(&entry);
            }
        }

        // Counted as a miss when it was absent or just expired
        if !state.index.access(&key_owned) {
            return None;
        }

        state.entries.get(key).cloned()
    }

    /// Copy the entry for `key` back onto `destinations` (item `i` onto
    /// destination `i`). Returns whether the key was found.
    pub async fn restore_into(
        &self,
        key: &str,
        destinations: &[PathBuf],
    ) -> Result<bool, CacheError> {
        let lock = self.key_lock(key);
        let restored = {
            let _guard = lock.lock().await;
            self.copy_out(key, destinations).await
        };
        drop(lock);
        self.release_key_lock(key);
        restored
    }

    async fn copy_out(&self, key: &str, destinations: &[PathBuf]) -> Result<bool, CacheError> {
        let Some(entry) = self.lookup(key) else {
            return Ok(false);
        };

        let destinations = destinations.to_vec();
        tokio::task::spawn_blocking(move || -> Result<(), CacheError> {
            for (i, dest) in destinations.iter().enumerate() {
                let item = entry.path.join(i.to_string());
                if fs::symlink_metadata(&item).is_ok() {
                    copy_tree(&item, dest)?;
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| CacheError::Write(format!("restore task failed: {}", e)))??;

        Ok(true)
    }

    /// Persist a copy of `source` under `key`, replacing any previous entry
    pub async fn save(&self, key: &str, source: &Path) -> Result<CacheEntry, CacheError> {
        self.save_paths(key, &[source.to_path_buf()]).await
    }

    /// Persist copies of several paths under one key. Missing paths are
    /// skipped; it is an error if none exist.
    pub async fn save_paths(
        &self,
        key: &str,
        sources: &[PathBuf],
    ) -> Result<CacheEntry, CacheError> {
        if key.is_empty() {
            return Err(CacheError::Key("cache key cannot be empty".to_string()));
        }

        let lock = self.key_lock(key);
        let saved = {
            let _guard = lock.lock().await;
            self.commit(key, sources).await
        };
        drop(lock);
        self.release_key_lock(key);

        let (entry, victim) = saved?;
        if let Some(evicted) = victim {
            self.discard_evicted(evicted).await;
        }

        tracing::info!(
            key = %entry.key,
            size_bytes = entry.size_bytes,
            "saved cache entry"
        );

        Ok(entry)
    }

    /// Write the entry and register it, returning the entry it displaced
    async fn commit(
        &self,
        key: &str,
        sources: &[PathBuf],
    ) -> Result<(CacheEntry, Option<CacheEntry>), CacheError> {
        let entry_dir = self.entry_dir(key);
        let staging_root = self.config.root.join("staging");
        let key_owned = key.to_string();
        let sources = sources.to_vec();

        let entry = tokio::task::spawn_blocking(move || {
            stage_and_commit(&key_owned, &sources, &staging_root, &entry_dir)
        })
        .await
        .map_err(|e| CacheError::Write(format!("save task failed: {}", e)))??;

        let victim = {
            let mut state = self.state();
            let victim = state.index.insert(entry.key.clone());
            state.entries.insert(entry.key.clone(), entry.clone());
            victim.and_then(|v| state.entries.remove(&v))
        };

        Ok((entry, victim))
    }

    async fn discard_evicted(&self, evicted: CacheEntry) {
        let lock = self.key_lock(&evicted.key);
        {
            let _guard = lock.lock().await;

            // Saved again while we waited for the lock
            if !self.state().index.contains(&evicted.key) {
                tracing::debug!(key = %evicted.key, "evicting cache entry");
                remove_entry_dir(&evicted);
            }
        }
        drop(lock);
        self.release_key_lock(&evicted.key);
    }

    /// Forget the lock of `key` once nobody holds or waits on it
    fn release_key_lock(&self, key: &str) {
        let mut locks = self.key_locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.key_locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Drop one entry. Returns whether it existed.
    pub fn remove(&self, key: &str) -> Result<bool, CacheError> {
        let entry = {
            let mut state = self.state();
            state.index.remove(&key.to_string());
            state.entries.remove(key)
        };

        self.release_key_lock(key);

        match entry {
            Some(entry) => {
                remove_path(&self.entry_dir(&entry.key))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drop every entry
    pub fn purge(&self) -> Result<(), CacheError> {
        {
            let mut state = self.state();
            state.index.purge();
            state.entries.clear();
        }
        self.key_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, lock| Arc::strong_count(lock) > 1);

        let entries_dir = self.config.root.join("entries");
        remove_path(&entries_dir)?;
        fs::create_dir_all(&entries_dir)?;
        Ok(())
    }

    /// Entries oldest first
    pub fn entries(&self) -> Vec<CacheEntry> {
        let state = self.state();
        state
            .index
            .keys_oldest_first()
            .into_iter()
            .filter_map(|k| state.entries.get(k).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.state().index.stats()
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("root", &self.config.root)
            .field("capacity", &self.config.capacity)
            .field("entries", &self.len())
            .finish()
    }
}

fn load_entry(entry_dir: &Path) -> Result<CacheEntry, CacheError> {
    let content = fs::read_to_string(entry_dir.join(META_FILE))?;
    let mut entry: CacheEntry = serde_json::from_str(&content)?;
    // The store may have moved since the entry was written
    entry.path = entry_dir.join(DATA_DIR);
    Ok(entry)
}

fn stored_copy(entry: &CacheEntry) -> PathBuf {
    if entry.sources.len() == 1 {
        entry.path.join("0")
    } else {
        entry.path.clone()
    }
}

fn remove_entry_dir(entry: &CacheEntry) {
    if let Some(entry_dir) = entry.path.parent() {
        if let Err(e) = remove_path(entry_dir) {
            tracing::warn!(key = %entry.key, error = %e, "failed to remove cache entry");
        }
    }
}

/// Copy sources into a fresh staging directory, then swap it in for the
/// current entry directory
fn stage_and_commit(
    key: &str,
    sources: &[PathBuf],
    staging_root: &Path,
    entry_dir: &Path,
) -> Result<CacheEntry, CacheError> {
    fs::create_dir_all(staging_root)?;
    let staging = tempfile::Builder::new()
        .prefix("save-")
        .tempdir_in(staging_root)?;

    let staged_entry = staging.path().join("entry");
    let staged_data = staged_entry.join(DATA_DIR);
    fs::create_dir_all(&staged_data)?;

    let mut size_bytes = 0;
    let mut any = false;
    for (i, source) in sources.iter().enumerate() {
        if fs::symlink_metadata(source).is_err() {
            tracing::debug!(path = %source.display(), "cache path does not exist, skipping");
            continue;
        }
        size_bytes += copy_tree(source, &staged_data.join(i.to_string()))?;
        any = true;
    }

    if !any {
        return Err(CacheError::Write(format!(
            "none of the cache paths exist: {}",
            sources
                .iter()
                .map(|s| s.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }

    let entry = CacheEntry {
        key: key.to_string(),
        path: entry_dir.join(DATA_DIR),
        last_write: Utc::now(),
        size_bytes,
        sources: sources.to_vec(),
    };
    fs::write(
        staged_entry.join(META_FILE),
        serde_json::to_vec_pretty(&entry)?,
    )?;

    // Move the old entry out of the way first; it is deleted with the staging dir
    if entry_dir.exists() {
        fs::rename(entry_dir, staging.path().join("previous"))?;
    }
    fs::rename(&staged_entry, entry_dir)?;

    Ok(entry)
}
