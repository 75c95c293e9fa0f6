//! Cache-or-fetch resolution for genre buckets.
//!
//! Each resolve moves through an explicit state transition:
//!
//! ```text
//! Fresh ──────────────────────────────► serve cache          (Origin::Cache)
//! Stale | Missing ─► Refetching ─┬─ ok ► put, serve fetched  (Origin::Fetched)
//!                                └─ err ┬ Stale   ► serve stale (Origin::StaleFallback)
//!                                       └ Missing ► CoreError::FetchUnavailable
//! ```

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::cache::{CacheEntry, CacheStore, now_epoch};
use crate::rate_limit::{FetchPolicy, Throttle};
use crate::record::{NormalizeReport, OpenLibraryScore, ScoreModel, genre_key, normalize_works};
use crate::source::{BookSource, OpenLibrary, SourceError};
use crate::{Config, CoreError, build_cache_store};

/// Freshness of a cache lookup at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
    Missing,
}

/// Classify a lookup result at `now` (epoch seconds).
pub fn classify(entry: Option<&CacheEntry>, now: u64) -> Freshness {
    match entry {
        None => Freshness::Missing,
        Some(e) if e.is_stale(now) => Freshness::Stale,
        Some(_) => Freshness::Fresh,
    }
}

/// Where the records of a [`Resolved`] came from.
#[derive(Debug, Clone, PartialEq)]
pub enum Origin {
    /// Fresh cache entry; no fetch attempted.
    Cache,
    /// Fetched from the source and written through to the cache.
    Fetched,
    /// The refetch failed and a stale entry was served instead.
    StaleFallback { reason: String },
}

/// Records for one genre bucket, with provenance.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub genre_key: String,
    pub records: Vec<crate::BookRecord>,
    pub origin: Origin,
    /// Epoch seconds of the fetch that produced `records`.
    pub fetched_at: u64,
    /// Present only when records were fetched in this call.
    pub report: Option<NormalizeReport>,
}

impl Resolved {
    fn from_entry(entry: CacheEntry, origin: Origin) -> Self {
        Self {
            genre_key: entry.genre_key,
            records: entry.records,
            origin,
            fetched_at: entry.fetched_at,
            report: None,
        }
    }

    pub fn is_stale_fallback(&self) -> bool {
        matches!(self.origin, Origin::StaleFallback { .. })
    }
}

/// Per-genre result of [`FetchOrchestrator::prefetch`].
#[derive(Debug)]
pub struct PrefetchOutcome {
    pub genre_key: String,
    pub result: Result<Resolved, CoreError>,
}

/// Owns the cache store and the source, and decides per genre whether to
/// serve cached records or refetch.
pub struct FetchOrchestrator {
    store: CacheStore,
    source: Arc<dyn BookSource>,
    client: reqwest::Client,
    policy: FetchPolicy,
    scores: Box<dyn ScoreModel>,
    site_base: String,
    /// One async lock per genre key so concurrent resolves refetch once.
    key_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl FetchOrchestrator {
    pub fn new(store: CacheStore, source: Arc<dyn BookSource>, timeout: Duration) -> Self {
        Self {
            store,
            source,
            client: reqwest::Client::new(),
            policy: FetchPolicy::new(timeout),
            scores: Box::new(OpenLibraryScore::current()),
            site_base: crate::DEFAULT_API_BASE.to_string(),
            key_locks: DashMap::new(),
        }
    }

    /// Open Library source, configured cache store, and throttling.
    pub fn from_config(config: &Config) -> Self {
        let store = build_cache_store(config.cache_path.as_deref(), config.ttl());
        let source = Arc::new(OpenLibrary::new(config.api_base.clone(), config.page_size));
        let mut orchestrator =
            Self::new(store, source, config.fetch_timeout()).with_site_base(&config.site_base);
        if config.requests_per_second > 0 {
            orchestrator =
                orchestrator.with_throttle(Throttle::per_second(config.requests_per_second));
        }
        orchestrator
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_throttle(mut self, throttle: Throttle) -> Self {
        self.policy = self.policy.throttled(throttle);
        self
    }

    pub fn with_score_model(mut self, scores: Box<dyn ScoreModel>) -> Self {
        self.scores = scores;
        self
    }

    pub fn with_site_base(mut self, site_base: &str) -> Self {
        self.site_base = site_base.to_string();
        self
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.key_locks
            .entry(key.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Records for `genre`: fresh cache, else a refetch, else stale cache.
    ///
    /// Fails with [`CoreError::FetchUnavailable`] only when nothing was ever
    /// cached for the genre and the fetch fails.
    pub async fn resolve(&self, genre: &str) -> Result<Resolved, CoreError> {
        let key = genre_key(genre);
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        let cached = self.store.get(&key);
        match (classify(cached.as_ref(), now_epoch()), cached) {
            (Freshness::Fresh, Some(entry)) => {
                tracing::debug!(genre = %key, records = entry.records.len(), "serving fresh cache");
                Ok(Resolved::from_entry(entry, Origin::Cache))
            }
            (state, cached) => {
                tracing::debug!(genre = %key, ?state, "refetching");
                self.refetch(&key, cached).await
            }
        }
    }

    /// Refetch `genre` regardless of freshness, with the same stale fallback
    /// as [`resolve`](Self::resolve).
    pub async fn refresh(&self, genre: &str) -> Result<Resolved, CoreError> {
        let key = genre_key(genre);
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        let cached = self.store.get(&key);
        self.refetch(&key, cached).await
    }

    /// Refresh each genre in turn, reporting every outcome to `on_progress`
    /// as it completes.
    pub async fn prefetch<S: AsRef<str>>(
        &self,
        genres: &[S],
        on_progress: impl Fn(&PrefetchOutcome),
    ) -> Vec<PrefetchOutcome> {
        let mut outcomes = Vec::with_capacity(genres.len());
        for genre in genres {
            let outcome = PrefetchOutcome {
                genre_key: genre_key(genre.as_ref()),
                result: self.refresh(genre.as_ref()).await,
            };
            on_progress(&outcome);
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn refetch(&self, key: &str, fallback: Option<CacheEntry>) -> Result<Resolved, CoreError> {
        let fetched = self
            .policy
            .fetch(self.source.as_ref(), key, &self.client)
            .await;

        match fetched {
            Ok(raw) => Ok(self.store_fetched(key, &raw)),
            Err(err) => self.fall_back(key, fallback, err),
        }
    }

    fn store_fetched(&self, key: &str, raw: &[serde_json::Value]) -> Resolved {
        let (records, report) = normalize_works(raw, key, self.scores.as_ref(), &self.site_base);
        if report.dropped() > 0 {
            tracing::warn!(
                genre = %key,
                malformed = report.malformed,
                duplicates = report.duplicates,
                kept = report.kept,
                "dropped works during normalization"
            );
        }
        tracing::info!(genre = %key, source = self.source.name(), records = records.len(), "fetched works");

        match self.store.put(key, records.clone()) {
            Ok(entry) => Resolved {
                report: Some(report),
                ..Resolved::from_entry(entry, Origin::Fetched)
            },
            Err(e) => {
                tracing::warn!(genre = %key, error = %e, "failed to persist fetched works, serving them uncached");
                Resolved {
                    genre_key: key.to_string(),
                    records,
                    origin: Origin::Fetched,
                    fetched_at: now_epoch(),
                    report: Some(report),
                }
            }
        }
    }

    fn fall_back(
        &self,
        key: &str,
        fallback: Option<CacheEntry>,
        err: SourceError,
    ) -> Result<Resolved, CoreError> {
        match fallback {
            Some(entry) => {
                tracing::warn!(
                    genre = %key,
                    error = %err,
                    age_secs = entry.age(now_epoch()).as_secs(),
                    "fetch failed, serving stale cache"
                );
                Ok(Resolved::from_entry(
                    entry,
                    Origin::StaleFallback {
                        reason: err.to_string(),
                    },
                ))
            }
            None => {
                tracing::warn!(genre = %key, error = %err, "fetch failed with nothing cached");
                Err(CoreError::FetchUnavailable {
                    genre: key.to_string(),
                    source: err,
                })
            }
        }
    }
}

impl std::fmt::Debug for FetchOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchOrchestrator")
            .field("store", &self.store)
            .field("source", &self.source.name())
            .field("policy", &self.policy)
            .field("site_base", &self.site_base)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(fetched_at: u64, ttl: Duration) -> CacheEntry {
        CacheEntry {
            genre_key: "fantasy".into(),
            records: vec![],
            fetched_at,
            ttl,
        }
    }

    #[test]
    fn classify_states() {
        let ttl = Duration::from_secs(100);
        assert_eq!(classify(None, 1_000), Freshness::Missing);
        assert_eq!(classify(Some(&entry(950, ttl)), 1_000), Freshness::Fresh);
        assert_eq!(classify(Some(&entry(900, ttl)), 1_000), Freshness::Fresh);
        assert_eq!(classify(Some(&entry(899, ttl)), 1_000), Freshness::Stale);
    }

    #[test]
    fn resolved_flags_stale_fallback() {
        let stale = Resolved::from_entry(
            entry(0, Duration::ZERO),
            Origin::StaleFallback {
                reason: "HTTP 503".into(),
            },
        );
        assert!(stale.is_stale_fallback());
        let cached = Resolved::from_entry(entry(0, Duration::ZERO), Origin::Cache);
        assert!(!cached.is_stale_fallback());
    }
}
