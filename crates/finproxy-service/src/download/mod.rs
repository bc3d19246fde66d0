//! Downloads JSON documents from upstream APIs.
//!
//! A single logical fetch consists of up to [`FetchConfig::max_attempts`] HTTP requests. Rate
//! limited responses (`429`) and transport failures are retried after an exponential backoff,
//! every other non-success status ends the fetch right away.

use std::future::Future;
use std::time::{Duration, Instant};

use reqwest::{StatusCode, Url};
use serde_json::Value;

use crate::config::FetchConfig;

mod error;

pub use error::FetchError;

/// Why an attempt is being retried.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryReason {
    /// The upstream answered with `429 Too Many Requests`.
    RateLimited,
    /// The attempt failed on the transport level.
    Network,
}

impl RetryReason {
    fn classify(error: &FetchError) -> Option<Self> {
        if error.is_rate_limited() {
            Some(Self::RateLimited)
        } else if error.is_network() {
            Some(Self::Network)
        } else {
            None
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "ratelimited",
            Self::Network => "network",
        }
    }

    /// The delay before the attempt following `attempt` (0-based).
    ///
    /// Rate limits back off with a factor of 2, transport failures with a factor of 1.5. Waits
    /// that do not fit into a [`Duration`] saturate at [`Duration::MAX`].
    pub fn backoff(&self, base: Duration, attempt: u32) -> Duration {
        let factor: f64 = match self {
            Self::RateLimited => 2.0,
            Self::Network => 1.5,
        };
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        Duration::try_from_secs_f64(base.as_secs_f64() * factor.powi(exponent).min(f64::MAX))
            .unwrap_or(Duration::MAX)
    }
}

/// Runs `task_gen` up to `config.max_attempts` times.
///
/// Only rate limits and transport failures are retried. Once the budget is spent, the error of
/// the final attempt is returned, and there is no wait after it.
pub async fn retry<G, F, T>(config: &FetchConfig, mut task_gen: G) -> Result<T, FetchError>
where
    G: FnMut() -> F,
    F: Future<Output = Result<T, FetchError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        let error = match task_gen().await {
            Ok(value) => break Ok(value),
            Err(error) => error,
        };

        let Some(reason) = RetryReason::classify(&error) else {
            break Err(error);
        };
        if attempt + 1 >= max_attempts {
            break Err(error);
        }

        let wait = reason.backoff(config.retry_delay, attempt);
        metric!(counter("fetch.retry") += 1, "reason" => reason.as_str());
        match reason {
            RetryReason::RateLimited => {
                tracing::info!("Rate limited. Waiting {:?} before retry", wait);
            }
            RetryReason::Network => {
                tracing::info!(
                    error = %error,
                    "Fetch attempt {} failed. Retrying in {:?}",
                    attempt + 1,
                    wait,
                );
            }
        }

        tokio::time::sleep(wait).await;
        attempt += 1;
    }
}

/// Fetches JSON documents with retries and per-attempt timeouts.
///
/// The fetcher holds no state apart from the connection pool of its client, so it can be cloned
/// freely into spawned tasks.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    config: FetchConfig,
}

impl Fetcher {
    pub fn new(client: reqwest::Client, config: FetchConfig) -> Self {
        Self { client, config }
    }

    /// Fetches `url` and parses the response body as JSON.
    pub async fn fetch(&self, url: &Url) -> Result<Value, FetchError> {
        tracing::debug!("Fetching `{}`", url);
        let start = Instant::now();

        let result = retry(&self.config, || self.fetch_once(url)).await;

        let status = match &result {
            Ok(_) => "success",
            Err(err) => err.metrics_tag(),
        };
        metric!(timer("fetch.duration") = start.elapsed(), "status" => status);

        match &result {
            Ok(_) => tracing::debug!("Fetched `{}` successfully", url),
            Err(err) => tracing::debug!("Fetching `{}` failed: {}", url, err),
        }

        result
    }

    /// Makes a single attempt, bounded by the attempt timeout.
    async fn fetch_once(&self, url: &Url) -> Result<Value, FetchError> {
        metric!(counter("fetch.attempt") += 1);
        tracing::debug!("Sending request to `{}`", url);

        let timeout = self.config.attempt_timeout;
        let request = async {
            // `Accept` and `User-Agent` are default headers of the client.
            let response = self.client.get(url.clone()).send().await?;

            let status = response.status();
            if !status.is_success() {
                tracing::debug!("Unexpected status code from `{}`: {}", url, status);
                return Err(status_error(status));
            }

            let body = response.bytes().await?;
            serde_json::from_slice(&body).map_err(|err| FetchError::Malformed(err.to_string()))
        };

        tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| FetchError::Timeout(timeout))?
    }
}

fn status_error(status: StatusCode) -> FetchError {
    FetchError::Status {
        status: status.as_u16(),
        reason: status.canonical_reason().unwrap_or("Unknown").to_owned(),
    }
}
