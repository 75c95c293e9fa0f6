//! Genre-keyed cache of normalized book records.
//!
//! **Memory** – [`DashMap`] index of whole [`CacheEntry`] snapshots.
//! **Disk** – Optional single JSON file holding every entry.
//!
//! The file is read once per process, on the first operation that touches the
//! store. Every [`put`](CacheStore::put) and [`clear`](CacheStore::clear)
//! rewrites the whole file through a temporary file in the same directory and
//! an atomic rename, so a failed write leaves the previous file intact. The
//! in-memory index is only updated after the disk write succeeds.
//!
//! Entries are never evicted for age. Staleness is reported by
//! [`CacheEntry::is_stale`] and acted on by the orchestrator.

use std::collections::{BTreeMap, HashSet};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::record::{BookRecord, genre_key};

/// Default time-to-live for cache entries: 24 hours.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// On-disk format version. Files with any other version are ignored.
const FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize cache: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to replace cache file: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// Seconds since the Unix epoch.
pub fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// One genre bucket: the full record set from a single successful fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub genre_key: String,
    pub records: Vec<BookRecord>,
    /// Epoch seconds of the fetch that produced `records`.
    pub fetched_at: u64,
    pub ttl: Duration,
}

impl CacheEntry {
    /// True iff more than `ttl` has passed between `fetched_at` and `now`.
    pub fn is_stale(&self, now: u64) -> bool {
        self.age(now) > self.ttl
    }

    pub fn age(&self, now: u64) -> Duration {
        Duration::from_secs(now.saturating_sub(self.fetched_at))
    }
}

/// Which entries [`CacheStore::clear`] removes.
#[derive(Debug, Clone, Copy)]
pub enum ClearScope<'a> {
    Genre(&'a str),
    All,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    fetched_at: u64,
    records: Vec<BookRecord>,
}

#[derive(Debug, Serialize)]
struct Snapshot {
    version: u32,
    entries: BTreeMap<String, StoredEntry>,
}

/// The file as read back: entries stay raw so one bad bucket can be skipped
/// without losing the others.
#[derive(Debug, Deserialize)]
struct RawSnapshot {
    version: u32,
    entries: BTreeMap<String, serde_json::Value>,
}

/// The cache file on disk.
struct JsonFile {
    path: PathBuf,
}

impl JsonFile {
    /// `Ok(None)` if the file does not exist.
    fn load(&self) -> Result<Option<RawSnapshot>, StorageError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn write(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let tmp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer_pretty(&mut writer, snapshot)?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)?;
        Ok(())
    }
}

/// Thread-safe store of genre buckets with optional JSON write-through.
pub struct CacheStore {
    entries: DashMap<String, CacheEntry>,
    /// Serializes snapshot writes so concurrent puts cannot interleave.
    file: Option<Mutex<JsonFile>>,
    loaded: OnceLock<()>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::in_memory(DEFAULT_TTL)
    }
}

impl CacheStore {
    /// A store without disk persistence.
    pub fn in_memory(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            file: None,
            loaded: OnceLock::new(),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// A store backed by the JSON file at `path`.
    ///
    /// Nothing is read until the first operation; a missing file is an empty
    /// cache.
    pub fn open(path: &Path, ttl: Duration) -> Self {
        Self {
            file: Some(Mutex::new(JsonFile {
                path: path.to_path_buf(),
            })),
            ..Self::in_memory(ttl)
        }
    }

    fn ensure_loaded(&self) {
        self.loaded.get_or_init(|| self.load_from_disk());
    }

    fn load_from_disk(&self) {
        let Some(ref file_mutex) = self.file else {
            return;
        };
        let file = file_mutex.lock().unwrap_or_else(|e| e.into_inner());
        let snapshot = match file.load() {
            Ok(Some(s)) => s,
            Ok(None) => {
                tracing::debug!(path = %file.path.display(), "no cache file yet");
                return;
            }
            Err(e) => {
                tracing::warn!(path = %file.path.display(), error = %e, "unreadable cache file, treating as empty");
                return;
            }
        };
        if snapshot.version != FORMAT_VERSION {
            tracing::warn!(
                path = %file.path.display(),
                found = snapshot.version,
                expected = FORMAT_VERSION,
                "cache file version mismatch, treating as empty"
            );
            return;
        }
        let mut count = 0;
        for (key, raw) in snapshot.entries {
            let stored: StoredEntry = match serde_json::from_value(raw) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(genre = %key, error = %e, "dropping invalid cache entry");
                    continue;
                }
            };
            count += 1;
            self.entries.insert(
                key.clone(),
                CacheEntry {
                    genre_key: key,
                    records: stored.records,
                    fetched_at: stored.fetched_at,
                    ttl: self.ttl,
                },
            );
        }
        tracing::info!(path = %file.path.display(), genres = count, "loaded book cache");
    }

    /// Look up the entry for `genre`, stale or not.
    pub fn get(&self, genre: &str) -> Option<CacheEntry> {
        self.ensure_loaded();
        let key = genre_key(genre);
        match self.entries.get(&key) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(genre = %key, "cache hit");
                Some(entry.value().clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(genre = %key, "cache miss");
                None
            }
        }
    }

    /// Replace the entry for `genre` with `records`, stamped now.
    ///
    /// Records sharing an id with an earlier record are dropped. On a storage
    /// error the previous entry (in memory and on disk) is left in place.
    pub fn put(&self, genre: &str, records: Vec<BookRecord>) -> Result<CacheEntry, StorageError> {
        let entry = CacheEntry {
            genre_key: genre_key(genre),
            records: dedupe_by_id(records),
            fetched_at: now_epoch(),
            ttl: self.ttl,
        };
        self.insert_entry(entry)
    }

    /// Store a prebuilt entry, keeping its `fetched_at`.
    ///
    /// The key is normalized and the TTL reset to the store's TTL.
    pub fn insert_entry(&self, mut entry: CacheEntry) -> Result<CacheEntry, StorageError> {
        self.ensure_loaded();
        entry.genre_key = genre_key(&entry.genre_key);
        entry.ttl = self.ttl;

        if let Some(ref file_mutex) = self.file {
            let file = file_mutex.lock().unwrap_or_else(|e| e.into_inner());
            let snapshot = self.snapshot_with(Some(&entry), &HashSet::new());
            file.write(&snapshot)?;
            self.entries.insert(entry.genre_key.clone(), entry.clone());
        } else {
            self.entries.insert(entry.genre_key.clone(), entry.clone());
        }
        tracing::info!(genre = %entry.genre_key, records = entry.records.len(), "cache entry stored");
        Ok(entry)
    }

    /// Remove entries. Returns how many were removed; clearing an absent key
    /// is a no-op.
    pub fn clear(&self, scope: ClearScope<'_>) -> Result<usize, StorageError> {
        self.ensure_loaded();
        let doomed: HashSet<String> = match scope {
            ClearScope::Genre(genre) => {
                let key = genre_key(genre);
                if self.entries.contains_key(&key) {
                    HashSet::from([key])
                } else {
                    HashSet::new()
                }
            }
            ClearScope::All => self.entries.iter().map(|e| e.key().clone()).collect(),
        };

        if let Some(ref file_mutex) = self.file {
            let file = file_mutex.lock().unwrap_or_else(|e| e.into_inner());
            if !doomed.is_empty() {
                let snapshot = self.snapshot_with(None, &doomed);
                file.write(&snapshot)?;
            }
        }
        for key in &doomed {
            self.entries.remove(key);
        }
        if !doomed.is_empty() {
            tracing::info!(removed = doomed.len(), "cache cleared");
        }
        Ok(doomed.len())
    }

    /// Build the on-disk snapshot of the current index, with `replacement`
    /// swapped in and `removed` keys left out.
    fn snapshot_with(&self, replacement: Option<&CacheEntry>, removed: &HashSet<String>) -> Snapshot {
        let mut entries: BTreeMap<String, StoredEntry> = self
            .entries
            .iter()
            .filter(|e| !removed.contains(e.key()))
            .map(|e| {
                (
                    e.key().clone(),
                    StoredEntry {
                        fetched_at: e.fetched_at,
                        records: e.records.clone(),
                    },
                )
            })
            .collect();
        if let Some(entry) = replacement {
            entries.insert(
                entry.genre_key.clone(),
                StoredEntry {
                    fetched_at: entry.fetched_at,
                    records: entry.records.clone(),
                },
            );
        }
        Snapshot {
            version: FORMAT_VERSION,
            entries,
        }
    }

    /// Whether `entry` is stale at `now` under this store's TTL.
    pub fn is_stale(&self, entry: &CacheEntry, now: u64) -> bool {
        now.saturating_sub(entry.fetched_at) > self.ttl.as_secs()
    }

    /// Cached genre keys, sorted.
    pub fn genres(&self) -> Vec<String> {
        self.ensure_loaded();
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Number of cached genre buckets.
    pub fn len(&self) -> usize {
        self.ensure_loaded();
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn has_persistence(&self) -> bool {
        self.file.is_some()
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.file
            .as_ref()
            .map(|f| f.lock().unwrap_or_else(|e| e.into_inner()).path.clone())
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("genres", &self.entries.len())
            .field("persistent", &self.has_persistence())
            .field("ttl", &self.ttl)
            .field("hits", &self.hits())
            .field("misses", &self.misses())
            .finish()
    }
}

fn dedupe_by_id(records: Vec<BookRecord>) -> Vec<BookRecord> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|r| seen.insert(r.id().to_string()))
        .collect()
}
