//! Request pacing for the remote book source.
//!
//! A [`FetchPolicy`] wraps every source call: it waits on the optional
//! [`Throttle`], bounds the call with a hard timeout, and on a 429 backs the
//! throttle off, sleeps for `Retry-After` and tries exactly once more.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use crate::source::{BookSource, RawRecords, SourceError};

type Gate = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Each 429 doubles the request spacing, up to `2^MAX_BACKOFF` times the base.
const MAX_BACKOFF: u32 = 4;

/// A throttle returns to its base spacing once this long passes without a 429.
const COOL_DOWN: Duration = Duration::from_secs(60);

/// Wait used when a 429 carries no usable `Retry-After`.
const DEFAULT_RETRY_WAIT: Duration = Duration::from_secs(2);

/// Spaces requests at a base interval that widens after 429 responses.
///
/// The governor in use is replaced wholesale through an [`ArcSwap`] whenever
/// the spacing changes, so waiters never block on a lock.
pub struct Throttle {
    base: Duration,
    gate: ArcSwap<Gate>,
    backoff: AtomicU32,
    last_hit: Mutex<Option<Instant>>,
}

impl Throttle {
    /// One request per `interval`; anything under a millisecond counts as one.
    pub fn every(interval: Duration) -> Self {
        let base = interval.max(Duration::from_millis(1));
        Self {
            base,
            gate: ArcSwap::from_pointee(gate(base)),
            backoff: AtomicU32::new(0),
            last_hit: Mutex::new(None),
        }
    }

    pub fn per_second(n: u32) -> Self {
        Self::every(Duration::from_millis(1000 / u64::from(n.max(1))))
    }

    /// Current spacing as a multiple of the base interval.
    pub fn slowdown(&self) -> u32 {
        1 << self.backoff.load(Ordering::SeqCst)
    }

    /// Block until the next request may go out.
    pub async fn wait(&self) {
        self.cool_down_at(Instant::now());
        let gate = self.gate.load_full();
        gate.until_ready().await;
    }

    /// Record a 429 and double the spacing.
    pub fn back_off(&self) {
        *self.last_hit.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        let prev = self
            .backoff
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| {
                Some((b + 1).min(MAX_BACKOFF))
            })
            .unwrap_or(MAX_BACKOFF);
        if prev < MAX_BACKOFF {
            self.gate.store(Arc::new(gate(self.base * (1 << (prev + 1)))));
        }
    }

    fn cool_down_at(&self, now: Instant) {
        let mut last_hit = self.last_hit.lock().unwrap_or_else(PoisonError::into_inner);
        let quiet = last_hit.is_some_and(|t| now.saturating_duration_since(t) >= COOL_DOWN);
        if quiet {
            *last_hit = None;
            if self.backoff.swap(0, Ordering::SeqCst) > 0 {
                self.gate.store(Arc::new(gate(self.base)));
            }
        }
    }
}

impl std::fmt::Debug for Throttle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttle")
            .field("base", &self.base)
            .field("slowdown", &self.slowdown())
            .finish()
    }
}

fn gate(interval: Duration) -> Gate {
    let quota = Quota::with_period(interval)
        .unwrap_or_else(|| Quota::per_second(std::num::NonZeroU32::MIN));
    Gate::direct(quota)
}

/// How a single source call is paced and bounded.
#[derive(Debug)]
pub struct FetchPolicy {
    timeout: Duration,
    throttle: Option<Throttle>,
}

impl FetchPolicy {
    /// Unthrottled calls, each cut off after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            throttle: None,
        }
    }

    pub fn throttled(mut self, throttle: Throttle) -> Self {
        self.throttle = Some(throttle);
        self
    }

    /// Fetch `genre_key` from `source`, retrying once after a 429.
    ///
    /// The `Retry-After` sleep is capped at the timeout. A second 429 is
    /// returned as-is.
    pub async fn fetch(
        &self,
        source: &dyn BookSource,
        genre_key: &str,
        client: &reqwest::Client,
    ) -> Result<RawRecords, SourceError> {
        match self.attempt(source, genre_key, client).await {
            Err(SourceError::RateLimited { retry_after }) => {
                if let Some(throttle) = &self.throttle {
                    throttle.back_off();
                }
                let wait = retry_after.unwrap_or(DEFAULT_RETRY_WAIT).min(self.timeout);
                tracing::info!(
                    source = source.name(),
                    genre = genre_key,
                    wait_secs = wait.as_secs_f64(),
                    "rate limited, retrying once"
                );
                tokio::time::sleep(wait).await;
                self.attempt(source, genre_key, client).await
            }
            other => other,
        }
    }

    async fn attempt(
        &self,
        source: &dyn BookSource,
        genre_key: &str,
        client: &reqwest::Client,
    ) -> Result<RawRecords, SourceError> {
        if let Some(throttle) = &self.throttle {
            throttle.wait().await;
        }
        tokio::time::timeout(self.timeout, source.fetch(genre_key, client, self.timeout))
            .await
            .unwrap_or(Err(SourceError::Timeout))
    }
}

/// `Err(RateLimited)` for a 429 response, carrying its `Retry-After` if any.
pub fn reject_rate_limited(resp: &reqwest::Response) -> Result<(), SourceError> {
    if resp.status() != reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Ok(());
    }
    let retry_after = resp
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    Err(SourceError::RateLimited { retry_after })
}

/// Delay-seconds form of `Retry-After`. An HTTP-date is not parsed and maps
/// to a flat five seconds.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        Some(Duration::from_secs(secs))
    } else if value.ends_with("GMT") {
        Some(Duration::from_secs(5))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::mock::{MockResponse, MockSource};
    use serde_json::json;

    fn response(status: u16, retry_after: Option<&str>) -> reqwest::Response {
        let mut builder = http::Response::builder().status(status);
        if let Some(v) = retry_after {
            builder = builder.header("retry-after", v);
        }
        reqwest::Response::from(builder.body("").unwrap())
    }

    #[test]
    fn retry_after_forms() {
        assert_eq!(parse_retry_after("5"), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after(" 0 "), Some(Duration::ZERO));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Duration::from_secs(5))
        );
        assert_eq!(parse_retry_after("soon"), None);
        assert_eq!(parse_retry_after("-3"), None);
    }

    #[test]
    fn only_429_is_rejected() {
        assert!(reject_rate_limited(&response(200, None)).is_ok());
        assert!(reject_rate_limited(&response(503, Some("10"))).is_ok());
        assert_eq!(
            reject_rate_limited(&response(429, Some("10"))),
            Err(SourceError::RateLimited {
                retry_after: Some(Duration::from_secs(10))
            })
        );
        assert_eq!(
            reject_rate_limited(&response(429, None)),
            Err(SourceError::RateLimited { retry_after: None })
        );
    }

    #[test]
    fn back_off_doubles_up_to_cap() {
        let throttle = Throttle::per_second(10);
        assert_eq!(throttle.slowdown(), 1);
        throttle.back_off();
        assert_eq!(throttle.slowdown(), 2);
        for _ in 0..10 {
            throttle.back_off();
        }
        assert_eq!(throttle.slowdown(), 1 << MAX_BACKOFF);
    }

    #[test]
    fn cool_down_needs_a_quiet_minute() {
        let throttle = Throttle::per_second(10);
        throttle.back_off();
        throttle.back_off();
        assert_eq!(throttle.slowdown(), 4);

        throttle.cool_down_at(Instant::now() + Duration::from_secs(30));
        assert_eq!(throttle.slowdown(), 4);

        throttle.cool_down_at(Instant::now() + COOL_DOWN + Duration::from_secs(1));
        assert_eq!(throttle.slowdown(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn success_first_try() {
        let source = MockSource::new(
            "Test",
            MockResponse::Works(vec![json!({"key": "/works/OL1W"})]),
        );
        let policy = FetchPolicy::new(Duration::from_secs(10)).throttled(Throttle::per_second(5));

        let works = policy
            .fetch(&source, "fantasy", &reqwest::Client::new())
            .await
            .unwrap();
        assert_eq!(works.len(), 1);
        assert_eq!(source.requested(), ["fantasy"]);
        assert_eq!(policy.throttle.as_ref().map(Throttle::slowdown), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn second_429_is_returned() {
        let source = MockSource::new(
            "Test",
            MockResponse::RateLimited {
                retry_after: Some(Duration::from_secs(5)),
            },
        );
        let policy = FetchPolicy::new(Duration::from_secs(10)).throttled(Throttle::per_second(5));

        let result = policy.fetch(&source, "fantasy", &reqwest::Client::new()).await;
        assert!(matches!(result, Err(SourceError::RateLimited { .. })));
        assert_eq!(source.call_count(), 2);
        assert_eq!(policy.throttle.as_ref().map(Throttle::slowdown), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_wait_is_capped_by_timeout() {
        let source = MockSource::with_sequence(
            "Test",
            vec![
                MockResponse::RateLimited {
                    retry_after: Some(Duration::from_secs(3600)),
                },
                MockResponse::Works(vec![]),
            ],
        );
        let policy = FetchPolicy::new(Duration::from_secs(2));

        let started = tokio::time::Instant::now();
        let result = policy.fetch(&source, "horror", &reqwest::Client::new()).await;
        assert_eq!(result, Ok(vec![]));
        assert_eq!(source.call_count(), 2);
        assert!(started.elapsed() <= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn other_errors_are_not_retried() {
        let source = MockSource::new(
            "Test",
            MockResponse::Error(SourceError::Network("connection refused".into())),
        );
        let policy = FetchPolicy::new(Duration::from_secs(10));

        let result = policy.fetch(&source, "fantasy", &reqwest::Client::new()).await;
        assert!(matches!(result, Err(SourceError::Network(_))));
        assert_eq!(source.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_source_times_out() {
        let source =
            MockSource::new("Test", MockResponse::Works(vec![])).with_delay(Duration::from_secs(30));
        let policy = FetchPolicy::new(Duration::from_secs(2));

        let result = policy.fetch(&source, "fantasy", &reqwest::Client::new()).await;
        assert_eq!(result, Err(SourceError::Timeout));
    }
}
