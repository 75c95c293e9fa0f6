//! Mock book source for testing.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{BookSource, RawRecords, SourceError};

/// A configurable mock response for [`MockSource`].
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Simulate a successful listing.
    Works(RawRecords),
    /// Simulate a 429 rate-limit response.
    RateLimited { retry_after: Option<Duration> },
    /// Simulate any other failure.
    Error(SourceError),
}

/// A hand-rolled mock implementing [`BookSource`] for tests.
///
/// Supports:
/// - A fixed response (used for every call), **or**
/// - A sequence of responses (one per call, repeating the last if exhausted).
/// - Optional per-call latency.
/// - Call counting and the genre keys requested.
pub struct MockSource {
    name: &'static str,
    /// Each call pops the next response; `fallback` once empty.
    responses: Mutex<Vec<MockResponse>>,
    fallback: MockResponse,
    delay: Option<Duration>,
    call_count: AtomicUsize,
    requested: Mutex<Vec<String>>,
}

impl MockSource {
    /// Create a mock that always returns `response`.
    pub fn new(name: &'static str, response: MockResponse) -> Self {
        Self {
            name,
            responses: Mutex::new(Vec::new()),
            fallback: response,
            delay: None,
            call_count: AtomicUsize::new(0),
            requested: Mutex::new(Vec::new()),
        }
    }

    /// Create a mock that returns responses in order, repeating the last one.
    ///
    /// An empty sequence behaves like a source that is always down.
    pub fn with_sequence(name: &'static str, mut responses: Vec<MockResponse>) -> Self {
        let fallback = responses
            .last()
            .cloned()
            .unwrap_or(MockResponse::Error(SourceError::Network("no response".into())));
        // Reverse so we can pop() from the front cheaply.
        responses.reverse();
        Self {
            responses: Mutex::new(responses),
            ..Self::new(name, fallback)
        }
    }

    /// Set simulated network latency per call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// How many times `fetch()` has been called.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Genre keys passed to `fetch()`, in call order.
    pub fn requested(&self) -> Vec<String> {
        self.requested
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn next_response(&self) -> MockResponse {
        let mut seq = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        seq.pop().unwrap_or_else(|| self.fallback.clone())
    }
}

impl BookSource for MockSource {
    fn name(&self) -> &str {
        self.name
    }

    fn fetch<'a>(
        &'a self,
        genre_key: &'a str,
        _client: &'a reqwest::Client,
        _timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<RawRecords, SourceError>> + Send + 'a>> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.requested
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(genre_key.to_string());
        let response = self.next_response();
        let delay = self.delay;

        Box::pin(async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }

            match response {
                MockResponse::Works(works) => Ok(works),
                MockResponse::RateLimited { retry_after } => {
                    Err(SourceError::RateLimited { retry_after })
                }
                MockResponse::Error(err) => Err(err),
            }
        })
    }
}
