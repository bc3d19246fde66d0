use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use sentry::{Hub, SentryFutureExt};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::Instrument;
use url::Url;

use super::FreshnessCache;
use crate::download::{FetchError, Fetcher};
use crate::utils::futures::CallOnDrop;

/// The outcome of one fetch, shared by everyone who waited on it.
pub type FetchResult = Result<Arc<Value>, FetchError>;

type PendingFetch = Shared<BoxFuture<'static, FetchResult>>;
type PendingMap = Arc<Mutex<HashMap<String, PendingFetch>>>;

/// Collapses concurrent fetches of the same URL into a single upstream request.
///
/// Fetches run as independent tasks on the given runtime. A caller that goes away does not cancel
/// the fetch, and the response still lands in the cache.
#[derive(Clone)]
pub struct FetchCoordinator {
    fetcher: Fetcher,
    cache: FreshnessCache,
    pending: PendingMap,
    runtime: tokio::runtime::Handle,
}

impl fmt::Debug for FetchCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchCoordinator")
            .field("fetcher", &self.fetcher)
            .field("cache", &self.cache)
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl FetchCoordinator {
    pub fn new(fetcher: Fetcher, cache: FreshnessCache, runtime: tokio::runtime::Handle) -> Self {
        Self {
            fetcher,
            cache,
            pending: Default::default(),
            runtime,
        }
    }

    /// Returns the response for `url`, joining an in-flight fetch for `key` if there is one.
    ///
    /// On success the response is written to the cache before any caller sees it. Failures are
    /// shared with every caller of the same fetch, but never cached.
    pub async fn get_or_fetch(&self, key: &str, url: &Url) -> FetchResult {
        let (fetch, job) = {
            let mut pending = lock(&self.pending);
            if let Some(fetch) = pending.get(key) {
                tracing::debug!("Joining in-flight fetch for `{}`", key);
                metric!(counter("fetch.deduplicated") += 1);
                (fetch.clone(), None)
            } else {
                let (sender, receiver) = oneshot::channel();
                let fetch = receiver
                    .map(|result| result.unwrap_or(Err(FetchError::InternalError)))
                    .boxed()
                    .shared();
                pending.insert(key.to_owned(), fetch.clone());
                metric!(gauge("pending_fetches") = pending.len() as u64);
                (fetch, Some(self.create_job(key, url, sender)))
            }
        };

        // Spawn outside of the lock. A task that is dropped right away removes itself from the map.
        if let Some(job) = job {
            self.runtime.spawn(job);
        }

        fetch.await
    }

    /// Whether a fetch for `key` is currently in flight.
    pub fn is_pending(&self, key: &str) -> bool {
        lock(&self.pending).contains_key(key)
    }

    /// The number of fetches currently in flight.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    fn create_job(
        &self,
        key: &str,
        url: &Url,
        sender: oneshot::Sender<FetchResult>,
    ) -> BoxFuture<'static, ()> {
        let remove_pending_token = {
            let key = key.to_owned();
            let pending = Arc::clone(&self.pending);
            CallOnDrop::new(move || {
                let mut pending = lock(&pending);
                pending.remove(&key);
                metric!(gauge("pending_fetches") = pending.len() as u64);
            })
        };

        let fetcher = self.fetcher.clone();
        let cache = self.cache.clone();
        let key = key.to_owned();
        let url = url.clone();
        let span = tracing::info_span!("fetch", url = %url);

        async move {
            let result = fetcher.fetch(&url).await.map(Arc::new);
            if let Ok(payload) = &result {
                cache.put(&key, Arc::clone(payload), cache.now());
            }
            // Evict from the map before waking the callers. Anyone who arrives afterwards either
            // finds the cache entry or starts a fresh fetch.
            drop(remove_pending_token);
            sender.send(result).ok();
        }
        .instrument(span)
        .bind_hub(Hub::new_from_top(Hub::current()))
        .boxed()
    }
}

fn lock(
    pending: &Mutex<HashMap<String, PendingFetch>>,
) -> MutexGuard<'_, HashMap<String, PendingFetch>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}
