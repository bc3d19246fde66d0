use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::config::CacheConfig;
use crate::utils::clock::Clock;

/// The last successful response for one URL.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    /// The requested URL.
    pub key: String,
    /// The JSON document as returned by the upstream.
    pub payload: Arc<Value>,
    /// When the fetch producing `payload` completed.
    pub fetched_at: Instant,
}

/// How usable a cached response is, given its age.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Freshness {
    /// There is no entry for the key.
    Absent,
    /// Younger than `fresh_ttl`, served without contacting the upstream.
    Fresh,
    /// Younger than `stale_ttl`, only served when fetching fails.
    Stale,
    /// At or past `stale_ttl`, never served.
    Expired,
}

impl Freshness {
    /// Classifies an entry of the given `age`.
    pub fn classify(age: Duration, config: &CacheConfig) -> Self {
        if age < config.fresh_ttl {
            Self::Fresh
        } else if age < config.stale_ttl {
            Self::Stale
        } else {
            Self::Expired
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Fresh => "fresh",
            Self::Stale => "stale",
            Self::Expired => "expired",
        }
    }
}

/// The result of [`FreshnessCache::lookup`].
#[derive(Clone, Debug)]
pub struct Lookup {
    pub entry: Option<CacheEntry>,
    pub freshness: Freshness,
}

impl Lookup {
    /// Returns the entry if it can be served as a direct hit.
    pub fn fresh(self) -> Option<CacheEntry> {
        match self.freshness {
            Freshness::Fresh => self.entry,
            _ => None,
        }
    }

    /// Returns the entry if it is stale, but still good enough as a fallback.
    ///
    /// Expired entries are treated exactly like missing ones.
    pub fn usable_stale(self) -> Option<CacheEntry> {
        match self.freshness {
            Freshness::Stale => self.entry,
            _ => None,
        }
    }
}

/// An in-memory store of the last successful response per URL.
///
/// Entries are only ever replaced by newer ones. Stale entries are kept around as a fallback until
/// they expire; the underlying [`moka`] cache reclaims them some time after `stale_ttl`.
#[derive(Clone)]
pub struct FreshnessCache {
    entries: moka::sync::Cache<String, CacheEntry>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for FreshnessCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreshnessCache")
            .field("config", &self.config)
            .field("entries", &self.entries.entry_count())
            .field("clock", &self.clock)
            .finish()
    }
}

impl FreshnessCache {
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let entries = moka::sync::Cache::builder()
            .name("responses")
            .max_capacity(config.capacity)
            .time_to_live(config.stale_ttl)
            .build();

        Self {
            entries,
            config,
            clock,
        }
    }

    /// The current time according to this cache's clock.
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Looks up `key` and classifies the entry by its age.
    ///
    /// This never blocks on I/O and never triggers a fetch.
    pub fn lookup(&self, key: &str) -> Lookup {
        let Some(entry) = self.entries.get(key) else {
            return Lookup {
                entry: None,
                freshness: Freshness::Absent,
            };
        };

        let age = self.now().saturating_duration_since(entry.fetched_at);
        let freshness = Freshness::classify(age, &self.config);
        tracing::trace!("Cache lookup for `{}`: {}", key, freshness.as_str());

        Lookup {
            entry: Some(entry),
            freshness,
        }
    }

    /// Stores `payload` as the response for `key`, fetched at `now`.
    ///
    /// An existing entry fetched later than `now` is kept, so the timestamp of a key never moves
    /// backwards.
    pub fn put(&self, key: &str, payload: Arc<Value>, now: Instant) {
        self.entries
            .entry(key.to_owned())
            .and_upsert_with(|existing| match existing {
                Some(existing) if existing.value().fetched_at > now => existing.into_value(),
                _ => CacheEntry {
                    key: key.to_owned(),
                    payload,
                    fetched_at: now,
                },
            });
    }

    /// Drops every cached response.
    pub fn clear(&self) {
        self.entries.invalidate_all();
    }

    /// The approximate number of cached responses.
    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::utils::clock::ManualClock;

    fn cache() -> (FreshnessCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let cache = FreshnessCache::new(CacheConfig::default(), clock.clone());
        (cache, clock)
    }

    #[test]
    fn test_classify() {
        let config = CacheConfig::default();
        let classify = |secs| Freshness::classify(Duration::from_secs(secs), &config);

        assert_eq!(classify(0), Freshness::Fresh);
        assert_eq!(classify(59), Freshness::Fresh);
        assert_eq!(classify(60), Freshness::Stale);
        assert_eq!(classify(599), Freshness::Stale);
        assert_eq!(classify(600), Freshness::Expired);
        assert_eq!(classify(3600), Freshness::Expired);
    }

    #[test]
    fn test_absent() {
        let (cache, _clock) = cache();
        let lookup = cache.lookup("https://x/ok");
        assert_eq!(lookup.freshness, Freshness::Absent);
        assert!(lookup.entry.is_none());
    }

    #[test]
    fn test_ages_through_classes() {
        let (cache, clock) = cache();
        let payload = Arc::new(json!({ "price": 42 }));
        cache.put("https://x/ok", payload.clone(), cache.now());

        let lookup = cache.lookup("https://x/ok");
        assert_eq!(lookup.freshness, Freshness::Fresh);
        assert_eq!(lookup.fresh().unwrap().payload, payload);

        clock.advance(Duration::from_secs(61));
        let lookup = cache.lookup("https://x/ok");
        assert_eq!(lookup.freshness, Freshness::Stale);
        assert!(lookup.clone().fresh().is_none());
        assert_eq!(lookup.usable_stale().unwrap().payload, payload);

        clock.advance(Duration::from_secs(540));
        let lookup = cache.lookup("https://x/ok");
        assert_eq!(lookup.freshness, Freshness::Expired);
        assert!(lookup.clone().fresh().is_none());
        assert!(lookup.usable_stale().is_none());
    }

    #[test]
    fn test_lookup_does_not_mutate() {
        let (cache, clock) = cache();
        cache.put("k", Arc::new(json!(1)), cache.now());
        clock.advance(Duration::from_secs(700));

        assert_eq!(cache.lookup("k").freshness, Freshness::Expired);
        // an expired entry is retained, only never served
        assert_eq!(cache.lookup("k").freshness, Freshness::Expired);
    }

    #[test]
    fn test_put_overwrites() {
        let (cache, clock) = cache();
        cache.put("k", Arc::new(json!(1)), cache.now());
        clock.advance(Duration::from_secs(120));
        cache.put("k", Arc::new(json!(2)), cache.now());

        let entry = cache.lookup("k").fresh().unwrap();
        assert_eq!(*entry.payload, json!(2));
        assert_eq!(entry.key, "k");
        assert_eq!(entry.fetched_at, cache.now());
    }

    #[test]
    fn test_put_keeps_timestamp_monotonic() {
        let (cache, clock) = cache();
        let earlier = cache.now();
        clock.advance(Duration::from_secs(10));
        cache.put("k", Arc::new(json!("newer")), cache.now());
        cache.put("k", Arc::new(json!("older")), earlier);

        let entry = cache.lookup("k").fresh().unwrap();
        assert_eq!(*entry.payload, json!("newer"));
    }

    #[test]
    fn test_clear() {
        let (cache, _clock) = cache();
        cache.put("k", Arc::new(json!(1)), cache.now());
        cache.clear();
        assert_eq!(cache.lookup("k").freshness, Freshness::Absent);
    }
}
