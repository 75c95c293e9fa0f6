//! Normalized book records and the scoring that derives their ranking fields.
//!
//! Raw works from the source arrive as loose JSON. [`normalize_works`] parses
//! each one into a [`RawWork`], derives `popularity`, `ranking`, and
//! `heat_index` through a [`ScoreModel`], and validates the result into a
//! [`BookRecord`]. Records that fail to parse or validate are dropped and
//! counted in the returned [`NormalizeReport`].

use std::collections::HashSet;

use chrono::Datelike;
use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Reserved genre key meaning "not restricted to a genre".
pub const ANY_GENRE: &str = "Any";

/// Genre assigned when the source provides none.
pub const UNKNOWN_GENRE: &str = "Unknown";

/// Earliest publication year considered plausible.
pub const EARLIEST_YEAR: i32 = 1450;

const UNKNOWN_TITLE: &str = "Unknown Title";

/// Normalize a user- or config-supplied genre into a cache partition key.
///
/// Keys are trimmed and lowercased; blank input and any casing of "any" map to
/// [`ANY_GENRE`].
pub fn genre_key(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(ANY_GENRE) {
        ANY_GENRE.to_string()
    } else {
        trimmed.to_lowercase()
    }
}

/// A work as returned by the Open Library subjects and trending endpoints.
///
/// The two endpoints spell a few fields differently (`authors` vs
/// `author_name`, `cover_id` vs `cover_i`); both spellings are accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawWork {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub authors: Vec<RawAuthor>,
    #[serde(default)]
    pub author_name: Vec<String>,
    #[serde(default)]
    pub first_publish_year: Option<i32>,
    #[serde(default, alias = "cover_i")]
    pub cover_id: Option<i64>,
    #[serde(default)]
    pub edition_count: Option<u32>,
    #[serde(default)]
    pub has_fulltext: Option<bool>,
    #[serde(default)]
    pub subject: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawAuthor {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
}

impl RawWork {
    fn author_names(&self) -> Vec<String> {
        let from_objects: Vec<String> = self
            .authors
            .iter()
            .filter_map(|a| a.name.as_deref())
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(String::from)
            .collect();
        if !from_objects.is_empty() {
            return from_objects;
        }
        self.author_name
            .iter()
            .map(|n| n.trim())
            .filter(|n| !n.is_empty())
            .map(String::from)
            .collect()
    }

    fn has_cover(&self) -> bool {
        self.cover_id.is_some_and(|id| id > 0)
    }
}

/// Deterministic derivation of the scored fields of a record.
///
/// Implementations must be pure: the same raw input always yields the same
/// popularity, and the same `(popularity, year)` the same heat index.
pub trait ScoreModel: Send + Sync {
    /// Popularity in `1..=5`.
    fn popularity(&self, work: &RawWork) -> u8;

    /// Composite of popularity and recency. Higher is hotter.
    fn heat_index(&self, popularity: u8, publication_year: Option<i32>) -> f64;

    /// The "current" year used for recency and year plausibility.
    fn reference_year(&self) -> i32;
}

/// Default scoring for Open Library works.
///
/// Popularity starts at 1 and gains a point for cover art, for 10+ editions,
/// for 50+ editions, and for full-text availability (or 200+ editions).
/// Heat index is `60 * popularity_share + 40 * recency` on a 0..=100 scale,
/// where recency decays as `1 / (1 + age / 10)`.
#[derive(Debug, Clone, Copy)]
pub struct OpenLibraryScore {
    reference_year: i32,
}

impl OpenLibraryScore {
    pub fn new(reference_year: i32) -> Self {
        Self { reference_year }
    }

    /// Score against the current calendar year.
    pub fn current() -> Self {
        Self::new(chrono::Utc::now().year())
    }
}

impl Default for OpenLibraryScore {
    fn default() -> Self {
        Self::current()
    }
}

impl ScoreModel for OpenLibraryScore {
    fn popularity(&self, work: &RawWork) -> u8 {
        let editions = work.edition_count.unwrap_or(0);
        let mut score = 1u8;
        if work.has_cover() {
            score += 1;
        }
        if editions >= 10 {
            score += 1;
        }
        if editions >= 50 {
            score += 1;
        }
        if work.has_fulltext == Some(true) || editions >= 200 {
            score += 1;
        }
        score.min(5)
    }

    fn heat_index(&self, popularity: u8, publication_year: Option<i32>) -> f64 {
        let share = f64::from(popularity.clamp(1, 5) - 1) / 4.0;
        let recency = match publication_year {
            Some(year) => {
                let age = f64::from((self.reference_year - year).max(0));
                1.0 / (1.0 + age / 10.0)
            }
            None => 0.0,
        };
        ((share * 60.0 + recency * 40.0) * 10.0).round() / 10.0
    }

    fn reference_year(&self) -> i32 {
        self.reference_year
    }
}

/// Unvalidated record fields, turned into a [`BookRecord`] by
/// [`into_record`](RecordDraft::into_record).
#[derive(Debug, Clone)]
pub struct RecordDraft {
    pub id: String,
    pub title: String,
    pub author_names: Vec<String>,
    pub genre: Option<String>,
    pub publication_year: Option<i32>,
    pub popularity: u8,
    pub ranking: u32,
    pub cover_id: Option<i64>,
}

impl RecordDraft {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: UNKNOWN_TITLE.to_string(),
            author_names: Vec::new(),
            genre: None,
            publication_year: None,
            popularity: 1,
            ranking: 1,
            cover_id: None,
        }
    }

    /// Validate and compute derived fields.
    ///
    /// Rejects an empty id, popularity outside `1..=5`, and a zero ranking.
    /// A publication year outside `EARLIEST_YEAR..=reference_year` is dropped
    /// rather than rejected.
    pub fn into_record(
        self,
        scores: &dyn ScoreModel,
        site_base: &str,
    ) -> Result<BookRecord, CoreError> {
        let id = self.id.trim().to_string();
        if id.is_empty() {
            return Err(CoreError::Validation("record id is empty".into()));
        }
        if !(1..=5).contains(&self.popularity) {
            return Err(CoreError::Validation(format!(
                "popularity {} for {id} is outside 1..=5",
                self.popularity
            )));
        }
        if self.ranking == 0 {
            return Err(CoreError::Validation(format!(
                "ranking for {id} must be at least 1"
            )));
        }

        let publication_year = self
            .publication_year
            .filter(|y| (EARLIEST_YEAR..=scores.reference_year()).contains(y));
        let genre = self
            .genre
            .map(|g| g.trim().to_string())
            .filter(|g| !g.is_empty())
            .unwrap_or_else(|| UNKNOWN_GENRE.to_string());
        let title = match self.title.trim() {
            "" => UNKNOWN_TITLE.to_string(),
            t => t.to_string(),
        };
        let heat_index = scores.heat_index(self.popularity, publication_year);
        let detail_url = detail_url(site_base, &id);

        Ok(BookRecord {
            id,
            title,
            author_names: self.author_names,
            genre,
            publication_year,
            popularity: self.popularity,
            ranking: self.ranking,
            heat_index,
            detail_url,
            cover_id: self.cover_id.filter(|c| *c > 0),
        })
    }
}

fn detail_url(site_base: &str, id: &str) -> String {
    let base = site_base.trim_end_matches('/');
    if id.starts_with('/') {
        format!("{base}{id}")
    } else {
        format!("{base}/{id}")
    }
}

/// A validated, normalized book entry.
///
/// Fields are read-only; construct through [`RecordDraft`]. Deserialized
/// records are re-validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StoredRecord")]
pub struct BookRecord {
    id: String,
    title: String,
    author_names: Vec<String>,
    genre: String,
    publication_year: Option<i32>,
    popularity: u8,
    ranking: u32,
    heat_index: f64,
    detail_url: String,
    cover_id: Option<i64>,
}

impl BookRecord {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn author_names(&self) -> &[String] {
        &self.author_names
    }

    /// Authors joined for display, or "Unknown Author".
    pub fn authors_display(&self) -> String {
        if self.author_names.is_empty() {
            "Unknown Author".to_string()
        } else {
            self.author_names.join(", ")
        }
    }

    pub fn genre(&self) -> &str {
        &self.genre
    }

    pub fn publication_year(&self) -> Option<i32> {
        self.publication_year
    }

    pub fn popularity(&self) -> u8 {
        self.popularity
    }

    pub fn ranking(&self) -> u32 {
        self.ranking
    }

    pub fn heat_index(&self) -> f64 {
        self.heat_index
    }

    pub fn detail_url(&self) -> &str {
        &self.detail_url
    }

    pub fn cover_id(&self) -> Option<i64> {
        self.cover_id
    }

    /// Medium-size cover image on the Open Library covers service.
    pub fn cover_url(&self) -> Option<String> {
        self.cover_id
            .map(|id| format!("https://covers.openlibrary.org/b/id/{id}-M.jpg"))
    }
}

#[derive(Deserialize)]
struct StoredRecord {
    id: String,
    title: String,
    #[serde(default)]
    author_names: Vec<String>,
    genre: String,
    #[serde(default)]
    publication_year: Option<i32>,
    popularity: u8,
    ranking: u32,
    heat_index: f64,
    detail_url: String,
    #[serde(default)]
    cover_id: Option<i64>,
}

impl TryFrom<StoredRecord> for BookRecord {
    type Error = String;

    fn try_from(s: StoredRecord) -> Result<Self, Self::Error> {
        if s.id.is_empty() {
            return Err("stored record has an empty id".into());
        }
        if !(1..=5).contains(&s.popularity) {
            return Err(format!("stored record {} has popularity {}", s.id, s.popularity));
        }
        if s.ranking == 0 {
            return Err(format!("stored record {} has ranking 0", s.id));
        }
        if !s.heat_index.is_finite() {
            return Err(format!("stored record {} has a non-finite heat index", s.id));
        }
        let latest = OpenLibraryScore::current().reference_year();
        if s
            .publication_year
            .is_some_and(|y| !(EARLIEST_YEAR..=latest).contains(&y))
        {
            return Err(format!("stored record {} has an implausible year", s.id));
        }
        if s.detail_url.trim().is_empty() {
            return Err(format!("stored record {} has no detail url", s.id));
        }
        Ok(BookRecord {
            id: s.id,
            title: s.title,
            author_names: s.author_names,
            genre: s.genre,
            publication_year: s.publication_year,
            popularity: s.popularity,
            ranking: s.ranking,
            heat_index: s.heat_index,
            detail_url: s.detail_url,
            cover_id: s.cover_id,
        })
    }
}

/// Counts from one normalization pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeReport {
    pub total: usize,
    pub kept: usize,
    /// Entries that were not a work object, lacked a key, or failed validation.
    pub malformed: usize,
    /// Entries sharing an id, or a title and author list, with an earlier entry.
    pub duplicates: usize,
}

impl NormalizeReport {
    pub fn dropped(&self) -> usize {
        self.malformed + self.duplicates
    }
}

/// Normalize raw source records fetched for `genre_key`.
///
/// `ranking` is the 1-based position in `raw`. For genre-scoped fetches every
/// record takes the genre key; for [`ANY_GENRE`] fetches the first subject of
/// the work is used, or [`UNKNOWN_GENRE`].
pub fn normalize_works(
    raw: &[serde_json::Value],
    genre_key: &str,
    scores: &dyn ScoreModel,
    site_base: &str,
) -> (Vec<BookRecord>, NormalizeReport) {
    let mut report = NormalizeReport {
        total: raw.len(),
        ..Default::default()
    };
    let mut records = Vec::with_capacity(raw.len());
    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut seen_works: HashSet<(String, String)> = HashSet::new();

    for (position, value) in raw.iter().enumerate() {
        let work: RawWork = match serde_json::from_value(value.clone()) {
            Ok(w) => w,
            Err(e) => {
                tracing::debug!(position, error = %e, "dropping unparseable work");
                report.malformed += 1;
                continue;
            }
        };
        let Some(id) = work.key.clone().filter(|k| !k.trim().is_empty()) else {
            tracing::debug!(position, "dropping work without a key");
            report.malformed += 1;
            continue;
        };

        let genre = if genre_key == ANY_GENRE {
            work.subject.first().map(|s| s.to_lowercase())
        } else {
            Some(genre_key.to_string())
        };
        let draft = RecordDraft {
            id,
            title: work.title.clone().unwrap_or_default(),
            author_names: work.author_names(),
            genre,
            publication_year: work.first_publish_year,
            popularity: scores.popularity(&work),
            ranking: u32::try_from(position + 1).unwrap_or(u32::MAX),
            cover_id: work.cover_id,
        };

        let record = match draft.into_record(scores, site_base) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(position, error = %e, "dropping invalid work");
                report.malformed += 1;
                continue;
            }
        };

        let work_key = (
            record.title().to_lowercase(),
            record.author_names().join(", ").to_lowercase(),
        );
        if seen_ids.contains(record.id()) || seen_works.contains(&work_key) {
            report.duplicates += 1;
            continue;
        }
        seen_ids.insert(record.id().to_string());
        seen_works.insert(work_key);
        records.push(record);
    }

    report.kept = records.len();
    (records, report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SITE: &str = "https://openlibrary.org";

    fn scores() -> OpenLibraryScore {
        OpenLibraryScore::new(2025)
    }

    fn work_with_editions(editions: u32) -> RawWork {
        RawWork {
            key: Some("/works/OL1W".into()),
            edition_count: Some(editions),
            ..Default::default()
        }
    }

    #[test]
    fn genre_key_normalization() {
        assert_eq!(genre_key("  Fantasy "), "fantasy");
        assert_eq!(genre_key("Science Fiction"), "science fiction");
        assert_eq!(genre_key("any"), ANY_GENRE);
        assert_eq!(genre_key("ANY"), ANY_GENRE);
        assert_eq!(genre_key("   "), ANY_GENRE);
    }

    #[test]
    fn popularity_stays_in_range() {
        let s = scores();
        let bare = RawWork::default();
        assert_eq!(s.popularity(&bare), 1);

        let maxed = RawWork {
            cover_id: Some(42),
            edition_count: Some(500),
            has_fulltext: Some(true),
            ..Default::default()
        };
        assert_eq!(s.popularity(&maxed), 5);
    }

    #[test]
    fn popularity_monotonic_in_edition_count() {
        let s = scores();
        let mut last = 0;
        for editions in [0, 1, 9, 10, 49, 50, 199, 200, 1000] {
            let p = s.popularity(&work_with_editions(editions));
            assert!(p >= last, "popularity dropped at {editions} editions");
            last = p;
        }
    }

    #[test]
    fn negative_cover_id_is_not_a_cover() {
        let s = scores();
        let work = RawWork {
            cover_id: Some(-1),
            ..Default::default()
        };
        assert_eq!(s.popularity(&work), 1);
    }

    #[test]
    fn heat_index_monotonic() {
        let s = scores();
        assert!(s.heat_index(5, Some(2020)) > s.heat_index(4, Some(2020)));
        assert!(s.heat_index(3, Some(2024)) > s.heat_index(3, Some(1990)));
        assert!(s.heat_index(3, Some(1990)) > s.heat_index(3, None));
        assert_eq!(s.heat_index(3, Some(2001)), s.heat_index(3, Some(2001)));
    }

    #[test]
    fn heat_index_bounds() {
        let s = scores();
        assert_eq!(s.heat_index(1, None), 0.0);
        assert_eq!(s.heat_index(5, Some(2025)), 100.0);
    }

    #[test]
    fn draft_rejects_out_of_range_popularity() {
        let mut draft = RecordDraft::new("a");
        draft.popularity = 6;
        assert!(matches!(
            draft.into_record(&scores(), SITE),
            Err(CoreError::Validation(_))
        ));

        let mut draft = RecordDraft::new("a");
        draft.popularity = 0;
        assert!(draft.into_record(&scores(), SITE).is_err());
    }

    #[test]
    fn draft_rejects_zero_ranking_and_empty_id() {
        let mut draft = RecordDraft::new("a");
        draft.ranking = 0;
        assert!(draft.into_record(&scores(), SITE).is_err());
        assert!(RecordDraft::new("  ").into_record(&scores(), SITE).is_err());
    }

    #[test]
    fn draft_drops_implausible_year() {
        let mut draft = RecordDraft::new("a");
        draft.publication_year = Some(1200);
        let r = draft.into_record(&scores(), SITE).unwrap();
        assert_eq!(r.publication_year(), None);

        let mut draft = RecordDraft::new("b");
        draft.publication_year = Some(2999);
        let r = draft.into_record(&scores(), SITE).unwrap();
        assert_eq!(r.publication_year(), None);
    }

    #[test]
    fn draft_defaults_genre_and_builds_urls() {
        let mut draft = RecordDraft::new("/works/OL45804W");
        draft.cover_id = Some(12345);
        let r = draft.into_record(&scores(), "https://openlibrary.org/").unwrap();
        assert_eq!(r.genre(), UNKNOWN_GENRE);
        assert_eq!(r.detail_url(), "https://openlibrary.org/works/OL45804W");
        assert_eq!(
            r.cover_url().unwrap(),
            "https://covers.openlibrary.org/b/id/12345-M.jpg"
        );
        assert_eq!(r.authors_display(), "Unknown Author");
    }

    #[test]
    fn normalize_subject_page() {
        let raw = vec![
            json!({
                "key": "/works/OL1W",
                "title": "Dune",
                "authors": [{"name": "Frank Herbert", "key": "/authors/OL1A"}],
                "first_publish_year": 1965,
                "cover_id": 11,
                "edition_count": 120
            }),
            json!({
                "key": "/works/OL2W",
                "title": "Hyperion",
                "authors": [{"name": "Dan Simmons"}],
                "first_publish_year": 1989
            }),
        ];
        let (records, report) = normalize_works(&raw, "science fiction", &scores(), SITE);
        assert_eq!(report.kept, 2);
        assert_eq!(report.dropped(), 0);
        assert_eq!(records[0].ranking(), 1);
        assert_eq!(records[1].ranking(), 2);
        assert_eq!(records[0].genre(), "science fiction");
        assert_eq!(records[0].author_names(), ["Frank Herbert"]);
        assert_eq!(records[0].popularity(), 4);
        assert_eq!(records[1].popularity(), 1);
    }

    #[test]
    fn normalize_trending_uses_search_field_names() {
        let raw = vec![json!({
            "key": "/works/OL9W",
            "title": "Project Hail Mary",
            "author_name": ["Andy Weir"],
            "cover_i": 777,
            "first_publish_year": 2021,
            "subject": ["Science Fiction", "Space"]
        })];
        let (records, _) = normalize_works(&raw, ANY_GENRE, &scores(), SITE);
        assert_eq!(records[0].author_names(), ["Andy Weir"]);
        assert_eq!(records[0].cover_id(), Some(777));
        assert_eq!(records[0].genre(), "science fiction");
    }

    #[test]
    fn normalize_drops_and_counts_malformed() {
        let raw = vec![
            json!({"key": "/works/OL1W", "title": "Good"}),
            json!({"title": "No key"}),
            json!("not an object"),
            json!({"key": "/works/OL3W", "title": 17}),
        ];
        let (records, report) = normalize_works(&raw, "fiction", &scores(), SITE);
        assert_eq!(records.len(), 1);
        assert_eq!(report.total, 4);
        assert_eq!(report.malformed, 3);
        assert_eq!(report.kept, 1);
    }

    #[test]
    fn normalize_collapses_duplicates() {
        let raw = vec![
            json!({"key": "/works/OL1W", "title": "Emma", "authors": [{"name": "Jane Austen"}]}),
            json!({"key": "/works/OL1W", "title": "Emma (again)"}),
            json!({"key": "/works/OL2W", "title": "EMMA", "authors": [{"name": "jane austen"}]}),
        ];
        let (records, report) = normalize_works(&raw, "romance", &scores(), SITE);
        assert_eq!(records.len(), 1);
        assert_eq!(report.duplicates, 2);
    }

    #[test]
    fn normalize_is_deterministic() {
        let raw = vec![
            json!({"key": "/works/OL1W", "title": "A", "edition_count": 60, "first_publish_year": 2001}),
            json!({"key": "/works/OL2W", "title": "B", "cover_id": 5, "first_publish_year": 2010}),
        ];
        let first = normalize_works(&raw, "fantasy", &scores(), SITE);
        let second = normalize_works(&raw, "fantasy", &scores(), SITE);
        assert_eq!(first, second);
    }

    #[test]
    fn stored_record_round_trip_validates() {
        let record = RecordDraft::new("/works/OL1W")
            .into_record(&scores(), SITE)
            .unwrap();
        let json = serde_json::to_string(&record).unwrap();
        let back: BookRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);

        let tampered = json.replace("\"popularity\":1", "\"popularity\":9");
        assert!(serde_json::from_str::<BookRecord>(&tampered).is_err());
    }

    #[test]
    fn stored_record_rejects_future_year_and_missing_link() {
        let record = RecordDraft {
            publication_year: Some(2001),
            ..RecordDraft::new("/works/OL1W")
        }
        .into_record(&scores(), SITE)
        .unwrap();
        let json = serde_json::to_string(&record).unwrap();

        let future = json.replace("\"publication_year\":2001", "\"publication_year\":9999");
        assert!(serde_json::from_str::<BookRecord>(&future).is_err());
        let ancient = json.replace("\"publication_year\":2001", "\"publication_year\":1200");
        assert!(serde_json::from_str::<BookRecord>(&ancient).is_err());

        let url = format!("\"detail_url\":\"{}/works/OL1W\"", SITE);
        assert!(json.contains(&url));
        let unlinked = json.replace(&url, "\"detail_url\":\"\"");
        assert!(serde_json::from_str::<BookRecord>(&unlinked).is_err());
    }
}
