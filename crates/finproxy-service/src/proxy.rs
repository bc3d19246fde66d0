//! The entry point for proxy requests.
//!
//! [`ProxyService::handle`] validates the requested URL, serves fresh responses straight from the
//! cache, and otherwise fetches through the [`FetchCoordinator`]. When fetching fails, a stale
//! cached response is served instead of the error, as long as one is still young enough.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::caching::{FetchCoordinator, FreshnessCache};
use crate::config::Config;
use crate::download::{FetchError, Fetcher};
use crate::utils::clock::{Clock, SystemClock};
use crate::utils::http;

/// Where the payload of a [`ProxyResponse`] came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CacheStatus {
    /// Served from the cache without contacting the upstream.
    Fresh,
    /// Just fetched from the upstream.
    New,
    /// Fetching failed, served from an older cached response.
    Stale,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::New => "new",
            Self::Stale => "stale",
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A successful proxy response.
#[derive(Clone, Debug, PartialEq)]
pub struct ProxyResponse {
    /// The upstream JSON document, unmodified.
    pub payload: Arc<Value>,
    pub cache_status: CacheStatus,
}

/// The requested URL cannot be proxied.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum InputError {
    #[error("URL is required")]
    Missing,
    #[error("Invalid URL format")]
    Malformed,
}

/// Errors returned by [`ProxyService::handle`].
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum ProxyError {
    /// The request was rejected before contacting the upstream.
    #[error(transparent)]
    InvalidInput(#[from] InputError),
    /// Fetching failed and there was no stale response to fall back to.
    #[error("failed to fetch from upstream")]
    FetchFailed(#[source] FetchError),
}

impl ProxyError {
    /// The message shown to the client.
    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidInput(err) => err.to_string(),
            Self::FetchFailed(FetchError::Timeout(_)) => "Request timed out".into(),
            Self::FetchFailed(FetchError::ConnectionReset(_)) => {
                "Connection reset - API may be rate limiting".into()
            }
            Self::FetchFailed(FetchError::ConnectTimeout(_)) => "Connection timed out".into(),
            Self::FetchFailed(err) => err.to_string(),
        }
    }

    /// Whether the client is at fault, as opposed to the upstream or the proxy.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidInput(_))
    }

    fn metrics_tag(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid",
            Self::FetchFailed(err) => err.metrics_tag(),
        }
    }
}

/// Checks that `url` is an absolute `http` or `https` URL.
pub fn validate_url(url: Option<&str>) -> Result<Url, InputError> {
    let url = match url {
        None | Some("") => return Err(InputError::Missing),
        Some(url) => url,
    };

    let parsed = Url::parse(url).map_err(|_| InputError::Malformed)?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        _ => Err(InputError::Malformed),
    }
}

/// Serves proxy requests from the cache or the upstream.
///
/// All state lives in here and is shared between clones, so a single instance is created at
/// startup and handed to every request.
#[derive(Clone, Debug)]
pub struct ProxyService {
    cache: FreshnessCache,
    coordinator: FetchCoordinator,
}

impl ProxyService {
    /// Creates the service, spawning upstream fetches on `io_runtime`.
    pub fn create(config: &Config, io_runtime: tokio::runtime::Handle) -> Result<Self> {
        Self::with_clock(config, io_runtime, Arc::new(SystemClock))
    }

    /// Creates the service with a custom clock for cache freshness.
    pub fn with_clock(
        config: &Config,
        io_runtime: tokio::runtime::Handle,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let client = http::create_client(&config.fetch)?;
        let fetcher = Fetcher::new(client, config.fetch);
        let cache = FreshnessCache::new(config.caches, clock);
        let coordinator = FetchCoordinator::new(fetcher, cache.clone(), io_runtime);

        Ok(Self { cache, coordinator })
    }

    pub fn cache(&self) -> &FreshnessCache {
        &self.cache
    }

    pub fn coordinator(&self) -> &FetchCoordinator {
        &self.coordinator
    }

    /// Returns the JSON document at `url`.
    pub async fn handle(&self, url: Option<&str>) -> Result<ProxyResponse, ProxyError> {
        let result = self.handle_inner(url).await;

        let status = match &result {
            Ok(response) => response.cache_status.as_str(),
            Err(err) => err.metrics_tag(),
        };
        metric!(counter("proxy.response") += 1, "status" => status);

        result
    }

    async fn handle_inner(&self, key: Option<&str>) -> Result<ProxyResponse, ProxyError> {
        let url = validate_url(key)?;
        // The raw input is the cache key, so equivalent spellings of a URL are cached separately.
        let key = key.unwrap_or_default();

        if let Some(entry) = self.cache.lookup(key).fresh() {
            tracing::debug!("Serving fresh cached response for `{}`", key);
            return Ok(ProxyResponse {
                payload: entry.payload,
                cache_status: CacheStatus::Fresh,
            });
        }

        let error = match self.coordinator.get_or_fetch(key, &url).await {
            Ok(payload) => {
                return Ok(ProxyResponse {
                    payload,
                    cache_status: CacheStatus::New,
                });
            }
            Err(error) => error,
        };

        match self.cache.lookup(key).usable_stale() {
            Some(entry) => {
                tracing::warn!(
                    error = %error,
                    "Fetching `{}` failed, serving stale cached response",
                    key,
                );
                Ok(ProxyResponse {
                    payload: entry.payload,
                    cache_status: CacheStatus::Stale,
                })
            }
            None => Err(ProxyError::FetchFailed(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use finproxy_test::Upstream;

    use super::*;
    use crate::caching::Freshness;
    use crate::config::FetchConfig;
    use crate::test;
    use crate::utils::clock::ManualClock;

    fn service(fetch: FetchConfig) -> (ProxyService, Arc<ManualClock>) {
        let config = Config {
            fetch,
            ..Default::default()
        };
        let clock = Arc::new(ManualClock::new());
        let service =
            ProxyService::with_clock(&config, tokio::runtime::Handle::current(), clock.clone())
                .unwrap();
        (service, clock)
    }

    fn fast_retries() -> FetchConfig {
        FetchConfig {
            retry_delay: Duration::from_millis(10),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_url() {
        assert_eq!(validate_url(None), Err(InputError::Missing));
        assert_eq!(validate_url(Some("")), Err(InputError::Missing));
        assert_eq!(validate_url(Some("not-a-url")), Err(InputError::Malformed));
        assert_eq!(validate_url(Some("/api/quote")), Err(InputError::Malformed));
        assert_eq!(
            validate_url(Some("ftp://example.com/quote.json")),
            Err(InputError::Malformed)
        );
        assert_eq!(validate_url(Some("https://")), Err(InputError::Malformed));

        let url = validate_url(Some("https://api.example.com/v1/quote?symbol=AAPL")).unwrap();
        assert_eq!(url.host_str(), Some("api.example.com"));
    }

    #[test]
    fn test_user_messages() {
        let message = |err: FetchError| ProxyError::FetchFailed(err).user_message();

        insta::assert_snapshot!(
            message(FetchError::Timeout(Duration::from_secs(25))),
            @"Request timed out"
        );
        insta::assert_snapshot!(
            message(FetchError::ConnectionReset("read ECONNRESET".into())),
            @"Connection reset - API may be rate limiting"
        );
        insta::assert_snapshot!(
            message(FetchError::ConnectTimeout("operation timed out".into())),
            @"Connection timed out"
        );
        insta::assert_snapshot!(
            message(FetchError::Network("dns error: no record found".into())),
            @"dns error: no record found"
        );
        insta::assert_snapshot!(
            message(FetchError::Status { status: 429, reason: "Too Many Requests".into() }),
            @"API returned status 429: Too Many Requests"
        );
        insta::assert_snapshot!(
            ProxyError::from(InputError::Missing).user_message(),
            @"URL is required"
        );
    }

    #[tokio::test]
    async fn test_new_then_fresh() {
        test::setup();
        let upstream = Upstream::new();
        let (service, _clock) = service(fast_retries());
        let url = upstream.url("json/price");

        let first = service.handle(Some(url.as_str())).await.unwrap();
        assert_eq!(first.cache_status, CacheStatus::New);
        assert_eq!(first.payload["price"], 42);

        let second = service.handle(Some(url.as_str())).await.unwrap();
        assert_eq!(second.cache_status, CacheStatus::Fresh);
        assert_eq!(second.payload, first.payload);
        assert_eq!(upstream.accesses(), 1);
    }

    #[tokio::test]
    async fn test_missing_url() {
        test::setup();
        let (service, _clock) = service(fast_retries());

        for input in [None, Some("")] {
            let err = service.handle(input).await.unwrap_err();
            assert_eq!(err, ProxyError::InvalidInput(InputError::Missing));
            assert_eq!(err.user_message(), "URL is required");
            assert!(err.is_client_error());
        }
        assert_eq!(service.coordinator().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_url() {
        test::setup();
        let (service, _clock) = service(fast_retries());

        let err = service.handle(Some("not-a-url")).await.unwrap_err();
        assert_eq!(err, ProxyError::InvalidInput(InputError::Malformed));
        assert_eq!(err.user_message(), "Invalid URL format");
        assert_eq!(
            service.cache().lookup("not-a-url").freshness,
            Freshness::Absent
        );
    }

    #[tokio::test]
    async fn test_all_attempts_time_out() {
        test::setup();
        let upstream = Upstream::new();
        let (service, _clock) = service(FetchConfig {
            attempt_timeout: Duration::from_millis(50),
            retry_delay: Duration::from_millis(10),
            ..Default::default()
        });
        let url = upstream.url("delay/1s/json/price");

        let err = service.handle(Some(url.as_str())).await.unwrap_err();

        assert_eq!(
            err,
            ProxyError::FetchFailed(FetchError::Timeout(Duration::from_millis(50)))
        );
        insta::assert_snapshot!(err.user_message(), @"Request timed out");
        assert!(!err.is_client_error());
        assert_eq!(upstream.accesses(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_fetch() {
        test::setup();
        let upstream = Upstream::new();
        let (service, _clock) = service(fast_retries());
        let url = upstream.url("delay/100ms/json/price");

        let responses =
            futures::future::join_all((0..5).map(|_| service.handle(Some(url.as_str())))).await;

        assert_eq!(upstream.accesses(), 1);
        for response in responses {
            let response = response.unwrap();
            assert_eq!(response.cache_status, CacheStatus::New);
            assert_eq!(*response.payload, finproxy_test::document("price"));
        }
        assert!(!service.coordinator().is_pending(url.as_str()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_requests_share_one_fetch() {
        test::setup();
        let upstream = Upstream::new();
        let (service, _clock) = service(fast_retries());
        let url = upstream.url("delay/100ms/json/price");

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let service = service.clone();
                let url = url.clone();
                tokio::spawn(async move { service.handle(Some(url.as_str())).await })
            })
            .collect();

        for task in tasks {
            let response = task.await.unwrap().unwrap();
            assert_eq!(response.cache_status, CacheStatus::New);
            assert_eq!(*response.payload, finproxy_test::document("price"));
        }
        assert_eq!(upstream.accesses(), 1);
        assert_eq!(service.coordinator().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_fresh_within_ttl() {
        test::setup();
        let upstream = Upstream::new();
        let (service, clock) = service(fast_retries());
        let url = upstream.url("json/price");

        service.handle(Some(url.as_str())).await.unwrap();
        clock.advance(Duration::from_secs(59));

        let response = service.handle(Some(url.as_str())).await.unwrap();
        assert_eq!(response.cache_status, CacheStatus::Fresh);
        assert_eq!(upstream.accesses(), 1);

        clock.advance(Duration::from_secs(2));
        let response = service.handle(Some(url.as_str())).await.unwrap();
        assert_eq!(response.cache_status, CacheStatus::New);
        assert_eq!(upstream.accesses(), 2);
    }

    #[tokio::test]
    async fn test_stale_fallback() {
        test::setup();
        let upstream = Upstream::new();
        let (service, clock) = service(fast_retries());
        let url = upstream.url("toggle/price");

        let original = service.handle(Some(url.as_str())).await.unwrap();
        assert_eq!(original.cache_status, CacheStatus::New);

        upstream.set_failing(true);
        clock.advance(Duration::from_secs(61));

        let response = service.handle(Some(url.as_str())).await.unwrap();
        assert_eq!(response.cache_status, CacheStatus::Stale);
        assert!(Arc::ptr_eq(&response.payload, &original.payload));
        // a failed fetch does not refresh the entry
        clock.advance(Duration::from_secs(60));
        let response = service.handle(Some(url.as_str())).await.unwrap();
        assert_eq!(response.cache_status, CacheStatus::Stale);
        assert_eq!(upstream.accesses(), 3);

        upstream.set_failing(false);
        let response = service.handle(Some(url.as_str())).await.unwrap();
        assert_eq!(response.cache_status, CacheStatus::New);
    }

    #[tokio::test]
    async fn test_expired_is_never_served() {
        test::setup();
        let upstream = Upstream::new();
        let (service, clock) = service(fast_retries());
        let url = upstream.url("toggle/price");

        service.handle(Some(url.as_str())).await.unwrap();
        upstream.set_failing(true);
        clock.advance(Duration::from_secs(601));

        let err = service.handle(Some(url.as_str())).await.unwrap_err();
        insta::assert_snapshot!(
            err.user_message(),
            @"API returned status 500: Internal Server Error"
        );
    }

    #[tokio::test]
    async fn test_rate_limited_then_new() {
        test::setup();
        let upstream = Upstream::new();
        let (service, _clock) = service(fast_retries());
        let url = upstream.url("ratelimited/2/quote");

        let response = service.handle(Some(url.as_str())).await.unwrap();

        assert_eq!(response.cache_status, CacheStatus::New);
        assert_eq!(upstream.accesses(), 3);
        assert_eq!(
            upstream.all_hits(),
            vec![("/ratelimited/2/quote".to_owned(), 3)]
        );
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        test::setup();
        let upstream = Upstream::new();
        let (service, _clock) = service(fast_retries());
        let url = upstream.url("respond_statuscode/404/quote");

        let err = service.handle(Some(url.as_str())).await.unwrap_err();

        assert_eq!(
            err,
            ProxyError::FetchFailed(FetchError::Status {
                status: 404,
                reason: "Not Found".into(),
            })
        );
        insta::assert_snapshot!(err.user_message(), @"API returned status 404: Not Found");
        assert_eq!(upstream.accesses(), 1);
        assert_eq!(service.coordinator().pending_count(), 0);
    }
}
