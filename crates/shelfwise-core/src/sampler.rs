//! Uniform random pick from a record set, for "surprise me" recommendations.

use crate::CoreError;
use crate::query::QueryFilters;
use crate::record::BookRecord;

/// Random record picker. Not cryptographically secure; only uniformity over
/// the candidate set matters.
pub struct Sampler {
    rng: fastrand::Rng,
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler {
    pub fn new() -> Self {
        Self {
            rng: fastrand::Rng::new(),
        }
    }

    /// Deterministic sequence of draws for a given seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: fastrand::Rng::with_seed(seed),
        }
    }

    /// Pick one record uniformly at random.
    pub fn sample_one(&mut self, records: &[BookRecord]) -> Result<BookRecord, CoreError> {
        if records.is_empty() {
            return Err(CoreError::EmptyPool);
        }
        let index = self.rng.usize(..records.len());
        Ok(records[index].clone())
    }

    /// Restrict to `genre` with the query engine's genre predicate (`"Any"`
    /// keeps everything), then pick one.
    pub fn sample_in_genre(
        &mut self,
        records: &[BookRecord],
        genre: &str,
    ) -> Result<BookRecord, CoreError> {
        let filters = QueryFilters::for_genre(genre);
        let pool: Vec<BookRecord> = records
            .iter()
            .filter(|r| filters.matches(r))
            .cloned()
            .collect();
        self.sample_one(&pool)
    }
}
