//! The core of the finproxy fetch proxy.
//!
//! The proxy shields a dashboard from slow, flaky and rate-limited JSON APIs. A request flows
//! through the [`ProxyService`](proxy::ProxyService), which consults the in-memory
//! [`FreshnessCache`](caching::FreshnessCache), collapses concurrent fetches of the same URL in the
//! [`FetchCoordinator`](caching::FetchCoordinator), and finally downloads through the retrying
//! [`Fetcher`](download::Fetcher).

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod download;
pub mod logging;
pub mod proxy;
pub mod utils;
