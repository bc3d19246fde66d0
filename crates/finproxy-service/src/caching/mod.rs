//! In-memory caching of upstream responses.
//!
//! The [`FreshnessCache`] keeps the last successful response per URL and classifies it by age.
//! The [`FetchCoordinator`] makes sure that concurrent requests for the same URL share one fetch.

mod coordinator;
mod freshness;

pub use coordinator::{FetchCoordinator, FetchResult};
pub use freshness::{CacheEntry, Freshness, FreshnessCache, Lookup};
