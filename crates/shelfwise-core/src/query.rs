//! Filtering and ordering over an in-memory record set.
//!
//! [`query`] is pure: it validates the filters, keeps the records matching
//! every set predicate, sorts by `ranking` ascending (ties: `heat_index`
//! descending, then `id` ascending), and truncates to `limit`.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::CoreError;
use crate::record::{ANY_GENRE, BookRecord};

/// Conjunctive record filters. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryFilters {
    /// Case-insensitive exact genre; `"Any"` matches all.
    pub genre: Option<String>,
    /// Inclusive lower bound on publication year.
    pub year_min: Option<i32>,
    /// Inclusive upper bound on publication year.
    pub year_max: Option<i32>,
    pub min_popularity: Option<u8>,
    pub max_ranking: Option<u32>,
    pub min_heat: Option<f64>,
}

impl QueryFilters {
    /// Filters restricted to a single genre.
    pub fn for_genre(genre: impl Into<String>) -> Self {
        Self {
            genre: Some(genre.into()),
            ..Default::default()
        }
    }

    /// Reject contradictory or out-of-range filter values.
    pub fn validate(&self) -> Result<(), CoreError> {
        if let (Some(min), Some(max)) = (self.year_min, self.year_max)
            && min > max
        {
            return Err(CoreError::Validation(format!(
                "year_min ({min}) is greater than year_max ({max})"
            )));
        }
        if let Some(p) = self.min_popularity
            && !(1..=5).contains(&p)
        {
            return Err(CoreError::Validation(format!(
                "min_popularity must be between 1 and 5, got {p}"
            )));
        }
        if self.max_ranking == Some(0) {
            return Err(CoreError::Validation("max_ranking must be at least 1".into()));
        }
        if let Some(h) = self.min_heat
            && !h.is_finite()
        {
            return Err(CoreError::Validation("min_heat must be a finite number".into()));
        }
        Ok(())
    }

    fn genre_filter(&self) -> Option<&str> {
        self.genre
            .as_deref()
            .map(str::trim)
            .filter(|g| !g.is_empty() && !g.eq_ignore_ascii_case(ANY_GENRE))
    }

    /// Whether `record` passes every set predicate.
    pub fn matches(&self, record: &BookRecord) -> bool {
        if let Some(genre) = self.genre_filter()
            && !record.genre().eq_ignore_ascii_case(genre)
        {
            return false;
        }
        if self.year_min.is_some() || self.year_max.is_some() {
            let Some(year) = record.publication_year() else {
                return false;
            };
            if self.year_min.is_some_and(|min| year < min) {
                return false;
            }
            if self.year_max.is_some_and(|max| year > max) {
                return false;
            }
        }
        if self.min_popularity.is_some_and(|p| record.popularity() < p) {
            return false;
        }
        if self.max_ranking.is_some_and(|r| record.ranking() > r) {
            return false;
        }
        if self.min_heat.is_some_and(|h| record.heat_index() < h) {
            return false;
        }
        true
    }
}

/// Result ordering: ranking asc, heat index desc, id asc.
pub fn result_order(a: &BookRecord, b: &BookRecord) -> Ordering {
    a.ranking()
        .cmp(&b.ranking())
        .then_with(|| b.heat_index().total_cmp(&a.heat_index()))
        .then_with(|| a.id().cmp(b.id()))
}

/// Filter, order, and truncate `records`.
///
/// `limit` must be positive; zero is rejected rather than clamped.
pub fn query(
    records: &[BookRecord],
    filters: &QueryFilters,
    limit: usize,
) -> Result<Vec<BookRecord>, CoreError> {
    if limit == 0 {
        return Err(CoreError::Validation("limit must be a positive integer".into()));
    }
    filters.validate()?;

    let mut matched: Vec<&BookRecord> = records.iter().filter(|r| filters.matches(r)).collect();
    matched.sort_by(|a, b| result_order(a, b));
    Ok(matched.into_iter().take(limit).cloned().collect())
}

/// Distinct genres present in `records`, sorted.
pub fn available_genres(records: &[BookRecord]) -> Vec<String> {
    records
        .iter()
        .map(|r| r.genre().to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
