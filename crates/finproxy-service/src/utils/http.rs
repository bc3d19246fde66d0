use anyhow::{Context, Result};
use reqwest::header;

use crate::config::FetchConfig;

/// The `User-Agent` sent with every upstream request.
pub const USER_AGENT: &str = concat!("finproxy/", env!("CARGO_PKG_VERSION"));

/// Creates the [`reqwest::Client`] used for all upstream requests.
///
/// * Every request asks for JSON and identifies itself with [`USER_AGENT`].
/// * `connect_timeout` bounds establishing a connection. The per-attempt timeout is applied by
///   the [`Fetcher`](crate::download::Fetcher) instead, so that it also covers the body.
/// * Redirects follow the reqwest default policy.
pub fn create_client(config: &FetchConfig) -> Result<reqwest::Client> {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::ACCEPT,
        header::HeaderValue::from_static("application/json"),
    );

    reqwest::ClientBuilder::new()
        .gzip(true)
        .hickory_dns(true)
        .user_agent(USER_AGENT)
        .default_headers(headers)
        .connect_timeout(config.connect_timeout)
        .pool_idle_timeout(config.pool_idle_timeout)
        .build()
        .context("failed to create the upstream HTTP client")
}
