//! Remote book sources and the trait the orchestrator fetches through.

pub mod mock;
pub mod openlibrary;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;

pub use openlibrary::OpenLibrary;

/// Raw work objects exactly as the source returned them. Parsing and
/// validation happen in [`normalize_works`](crate::record::normalize_works).
pub type RawRecords = Vec<serde_json::Value>;

/// Why a fetch from a source failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    /// Server returned 429 Too Many Requests.
    #[error("rate limited (429){}", retry_suffix(.retry_after))]
    RateLimited { retry_after: Option<Duration> },
    #[error("request timed out")]
    Timeout,
    #[error("HTTP {0}")]
    Http(u16),
    #[error("network error: {0}")]
    Network(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

fn retry_suffix(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(", retry after {:.1}s", d.as_secs_f64()),
        None => String::new(),
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SourceError::Timeout
        } else if e.is_decode() {
            SourceError::Malformed(e.to_string())
        } else {
            SourceError::Network(e.to_string())
        }
    }
}

/// A remote catalogue that can list works for a genre.
pub trait BookSource: Send + Sync {
    /// Display name (e.g. "Open Library").
    fn name(&self) -> &str;

    /// Fetch raw works for a normalized genre key. [`ANY_GENRE`](crate::ANY_GENRE)
    /// asks for an unfiltered listing.
    fn fetch<'a>(
        &'a self,
        genre_key: &'a str,
        client: &'a reqwest::Client,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<RawRecords, SourceError>> + Send + 'a>>;
}
