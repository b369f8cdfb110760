//! Cache-aware fetching: single-flight lookup, retried upstream call, batching.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::instrument;

use coalesce_cache::SingleFlightCache;
use coalesce_core::error::Result;
use coalesce_core::keys::CacheKey;

use crate::batch::{BatchConfig, BatchScheduler};
use crate::retry::{AttemptError, RetryConfig, RetryableFetcher};

/// Composes [`SingleFlightCache`], [`RetryableFetcher`] and [`BatchScheduler`].
///
/// A miss runs the retried upstream call as the cache producer, so concurrent
/// lookups of one key share a single retry loop.
#[derive(Clone)]
pub struct CachedSource {
    cache: Arc<SingleFlightCache>,
    fetcher: RetryableFetcher,
    scheduler: BatchScheduler,
}

impl CachedSource {
    /// Creates a source over a shared cache.
    pub fn new(cache: Arc<SingleFlightCache>, retry: RetryConfig, batch: BatchConfig) -> Self {
        Self {
            cache,
            fetcher: RetryableFetcher::new(retry),
            scheduler: BatchScheduler::new(batch),
        }
    }

    /// Creates a source with default retry and batch settings.
    pub fn with_defaults(cache: Arc<SingleFlightCache>) -> Self {
        Self::new(cache, RetryConfig::default(), BatchConfig::default())
    }

    /// Returns the shared cache.
    pub fn cache(&self) -> &Arc<SingleFlightCache> {
        &self.cache
    }

    /// Returns the retrying fetcher.
    pub fn fetcher(&self) -> &RetryableFetcher {
        &self.fetcher
    }

    /// Returns the batch scheduler.
    pub fn scheduler(&self) -> &BatchScheduler {
        &self.scheduler
    }

    /// Looks up `key`, fetching with `attempt` under the retry policy on a miss.
    #[instrument(skip(self, key, attempt), fields(key = %key))]
    pub async fn get<T, A, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        operation: &str,
        attempt: A,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        A: FnMut(u32) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, AttemptError>> + Send + 'static,
    {
        let fetcher = self.fetcher.clone();
        let operation = operation.to_string();

        self.cache
            .get_or_set(
                key.as_str(),
                move || async move { fetcher.fetch(&operation, attempt).await.map(Some) },
                ttl,
            )
            .await
    }

    /// Looks up every target through [`get`](Self::get) in paced groups.
    ///
    /// `key_fn` names each target's cache entry and `attempt_fn` builds its
    /// upstream call. Results keep the order of `targets`.
    pub async fn get_many<I, T, K, M, A, Fut>(
        &self,
        targets: Vec<I>,
        key_fn: K,
        ttl: Duration,
        operation: &str,
        attempt_fn: M,
    ) -> Result<Vec<Option<T>>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        K: Fn(&I) -> CacheKey,
        M: Fn(I) -> A,
        A: FnMut(u32) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, AttemptError>> + Send + 'static,
    {
        self.scheduler
            .fetch_all(targets, |target| {
                let key = key_fn(&target);
                let attempt = attempt_fn(target);
                async move { self.get(&key, ttl, operation, attempt).await }
            })
            .await
    }

    /// Drops the cached entry for `key`.
    pub async fn invalidate(&self, key: &CacheKey) -> Result<()> {
        self.cache.invalidate(key.as_str()).await
    }
}
