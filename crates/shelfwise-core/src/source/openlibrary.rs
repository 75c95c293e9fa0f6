use super::{BookSource, RawRecords, SourceError};
use crate::rate_limit::reject_rate_limited;
use crate::record::ANY_GENRE;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

const USER_AGENT: &str = "shelfwise/0.1 (book recommendations)";

pub struct OpenLibrary {
    pub api_base: String,
    pub page_size: usize,
}

impl OpenLibrary {
    pub fn new(api_base: impl Into<String>, page_size: usize) -> Self {
        Self {
            api_base: api_base.into(),
            page_size,
        }
    }

    /// Listing URL for a genre key. Subjects are slugged with underscores
    /// (`science fiction` → `science_fiction`); [`ANY_GENRE`] maps to the daily
    /// trending list.
    pub fn url_for(&self, genre_key: &str) -> String {
        let base = self.api_base.trim_end_matches('/');
        if genre_key == ANY_GENRE {
            format!("{}/trending/daily.json?limit={}", base, self.page_size)
        } else {
            let slug = genre_key.trim().to_lowercase().replace(' ', "_");
            format!(
                "{}/subjects/{}.json?limit={}",
                base,
                urlencoding::encode(&slug),
                self.page_size
            )
        }
    }
}

/// Pull the `works` array out of a subjects or trending response.
pub fn extract_works(data: serde_json::Value) -> Result<RawRecords, SourceError> {
    match data {
        serde_json::Value::Object(mut map) => match map.remove("works") {
            Some(serde_json::Value::Array(works)) => Ok(works),
            Some(_) => Err(SourceError::Malformed("`works` is not an array".into())),
            None => Err(SourceError::Malformed("response has no `works` field".into())),
        },
        _ => Err(SourceError::Malformed("response is not a JSON object".into())),
    }
}

impl BookSource for OpenLibrary {
    fn name(&self) -> &str {
        "Open Library"
    }

    fn fetch<'a>(
        &'a self,
        genre_key: &'a str,
        client: &'a reqwest::Client,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<RawRecords, SourceError>> + Send + 'a>> {
        Box::pin(async move {
            let url = self.url_for(genre_key);
            tracing::debug!(%url, "fetching works");

            let resp = client
                .get(&url)
                .header("User-Agent", USER_AGENT)
                .timeout(timeout)
                .send()
                .await?;

            reject_rate_limited(&resp)?;
            let status = resp.status();
            if !status.is_success() {
                return Err(SourceError::Http(status.as_u16()));
            }

            let data: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| SourceError::Malformed(e.to_string()))?;
            extract_works(data)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn subject_url_is_slugged() {
        let ol = OpenLibrary::new("https://openlibrary.org/", 100);
        assert_eq!(
            ol.url_for("science fiction"),
            "https://openlibrary.org/subjects/science_fiction.json?limit=100"
        );
        assert_eq!(
            ol.url_for("fantasy"),
            "https://openlibrary.org/subjects/fantasy.json?limit=100"
        );
    }

    #[test]
    fn any_uses_trending() {
        let ol = OpenLibrary::new("https://openlibrary.org", 25);
        assert_eq!(
            ol.url_for(ANY_GENRE),
            "https://openlibrary.org/trending/daily.json?limit=25"
        );
    }

    #[test]
    fn subject_is_url_encoded() {
        let ol = OpenLibrary::new("http://localhost:8080", 10);
        assert_eq!(
            ol.url_for("children's books"),
            "http://localhost:8080/subjects/children%27s_books.json?limit=10"
        );
    }

    #[test]
    fn extract_works_array() {
        let works = extract_works(json!({"name": "fantasy", "works": [{"key": "/works/OL1W"}]}))
            .unwrap();
        assert_eq!(works.len(), 1);
    }

    #[test]
    fn extract_works_rejects_bad_shapes() {
        assert!(matches!(
            extract_works(json!({"name": "fantasy"})),
            Err(SourceError::Malformed(_))
        ));
        assert!(matches!(
            extract_works(json!({"works": {"key": "x"}})),
            Err(SourceError::Malformed(_))
        ));
        assert!(matches!(
            extract_works(json!([1, 2, 3])),
            Err(SourceError::Malformed(_))
        ));
    }
}
