use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

pub mod cache;
pub mod config_file;
pub mod orchestrator;
pub mod query;
pub mod rate_limit;
pub mod record;
pub mod sampler;
pub mod source;

// Re-export for convenience
pub use cache::{CacheEntry, CacheStore, ClearScope, DEFAULT_TTL, StorageError, now_epoch};
pub use orchestrator::{FetchOrchestrator, Freshness, Origin, PrefetchOutcome, Resolved};
pub use query::{QueryFilters, available_genres, query};
pub use rate_limit::{FetchPolicy, Throttle};
pub use record::{
    ANY_GENRE, BookRecord, NormalizeReport, OpenLibraryScore, RecordDraft, ScoreModel,
    UNKNOWN_GENRE, genre_key, normalize_works,
};
pub use sampler::Sampler;
pub use source::{BookSource, RawRecords, SourceError};

/// Default Open Library endpoint for both the JSON API and detail pages.
pub const DEFAULT_API_BASE: &str = "https://openlibrary.org";

/// Genres fetched by `refresh` when none are named explicitly.
pub const DEFAULT_GENRES: &[&str] = &[
    "fiction",
    "mystery",
    "science fiction",
    "fantasy",
    "romance",
    "horror",
    "history",
    "biography",
];

#[derive(Error, Debug)]
pub enum CoreError {
    /// Nothing cached for the genre and the remote fetch failed.
    #[error("no cached books for '{genre}' and the fetch failed: {source}")]
    FetchUnavailable {
        genre: String,
        #[source]
        source: SourceError,
    },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("no books match the current filters")]
    EmptyPool,
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Resolved runtime configuration for the core.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the JSON API (`/subjects/...`, `/trending/...`).
    pub api_base: String,
    /// Base URL that record ids are appended to for detail links.
    pub site_base: String,
    /// Path to the JSON cache file. `None` keeps the cache in memory only.
    pub cache_path: Option<PathBuf>,
    pub cache_ttl_secs: u64,
    pub fetch_timeout_secs: u64,
    /// Number of works requested per genre.
    pub page_size: usize,
    pub default_limit: usize,
    pub default_genres: Vec<String>,
    /// Outgoing request budget for the source. Zero disables throttling.
    pub requests_per_second: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            site_base: DEFAULT_API_BASE.to_string(),
            cache_path: default_cache_path(),
            cache_ttl_secs: DEFAULT_TTL.as_secs(),
            fetch_timeout_secs: 10,
            page_size: 100,
            default_limit: 10,
            default_genres: DEFAULT_GENRES.iter().map(|g| g.to_string()).collect(),
            requests_per_second: 2,
        }
    }
}

impl Config {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

/// Platform cache file: `<cache_dir>/shelfwise/books_cache.json`.
pub fn default_cache_path() -> Option<PathBuf> {
    dirs::cache_dir().map(|d| d.join("shelfwise").join("books_cache.json"))
}

/// Build a [`CacheStore`] from configuration.
///
/// If `cache_path` is set, the store is backed by that JSON file (loaded lazily
/// on first access). If the parent directory cannot be created, falls back to
/// an in-memory store.
pub fn build_cache_store(cache_path: Option<&Path>, ttl: Duration) -> CacheStore {
    if let Some(path) = cache_path {
        let parent_ok = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
            _ => Ok(()),
        };
        match parent_ok {
            Ok(()) => {
                tracing::info!(path = %path.display(), "using persistent book cache");
                return CacheStore::open(path, ttl);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to prepare cache directory, falling back to in-memory");
            }
        }
    }
    CacheStore::in_memory(ttl)
}
