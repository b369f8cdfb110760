//! Single-flight cache coordinator.
//!
//! [`SingleFlightCache::get_or_set`] serves a value from the store when it can.
//! On a miss it either attaches the caller to the producer call already running
//! for that key, or starts one. At most one producer call per key is in flight
//! in this process at any instant.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use coalesce_core::constants::{ttl_seconds, DEFAULT_TTL_SECONDS};
use coalesce_core::error::{CoalesceError, Result};
use coalesce_core::traits::CacheStore;

/// What every waiter of one producer call receives. `None` means absent.
type FlightOutcome = std::result::Result<Option<Bytes>, CoalesceError>;

/// One outstanding producer call, shareable between waiters.
type Flight = Shared<BoxFuture<'static, FlightOutcome>>;

type FlightTable = DashMap<String, Flight>;

/// Cache configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL used by [`SingleFlightCache::get_or_set_default`]
    pub default_ttl_seconds: u64,
    /// Propagate unclassified producer errors instead of resolving to absent
    pub strict_errors: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: DEFAULT_TTL_SECONDS,
            strict_errors: false,
        }
    }
}

impl CacheConfig {
    /// Sets the default TTL, rounded up to whole seconds.
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl_seconds = ttl_seconds(ttl);
        self
    }

    /// Rejects a zero default TTL.
    pub fn validate(&self) -> Result<()> {
        if self.default_ttl_seconds == 0 {
            return Err(CoalesceError::Config("default_ttl_seconds must be at least 1".into()));
        }
        Ok(())
    }

    /// Enables propagation of unclassified producer errors.
    pub fn strict(mut self) -> Self {
        self.strict_errors = true;
        self
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    joined: AtomicU64,
    producer_calls: AtomicU64,
    store_errors: AtomicU64,
    corrupt_entries: AtomicU64,
}

/// Snapshot of cache activity.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlightStats {
    /// Lookups answered from the store
    pub hits: u64,
    /// Lookups that had to wait on a producer call
    pub misses: u64,
    /// Misses that attached to a call started by someone else
    pub joined: u64,
    /// Producer calls actually run
    pub producer_calls: u64,
    /// Store reads or writes that failed
    pub store_errors: u64,
    /// Stored payloads that failed to decode
    pub corrupt_entries: u64,
}

/// Removes the in-flight entry when the producer task finishes, panics, or is
/// dropped by runtime shutdown.
struct FlightGuard {
    table: Arc<FlightTable>,
    key: String,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.table.remove(&self.key);
    }
}

/// Single-flight, TTL-based cache over a [`CacheStore`].
///
/// Create one per process and share it (it is cheap to wrap in an `Arc`).
/// Deduplication is process-local: two processes sharing one store may both
/// call the producer for the same key.
pub struct SingleFlightCache {
    store: Arc<dyn CacheStore>,
    in_flight: Arc<FlightTable>,
    config: CacheConfig,
    counters: Arc<Counters>,
}

impl SingleFlightCache {
    /// Creates a cache over `store` with default configuration.
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self::with_config(store, CacheConfig::default())
    }

    /// Creates a cache with custom configuration.
    pub fn with_config(store: Arc<dyn CacheStore>, config: CacheConfig) -> Self {
        Self {
            store,
            in_flight: Arc::new(DashMap::new()),
            config,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Returns the cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Returns the cached value for `key`, computing it with `producer` on a miss.
    ///
    /// - A stored value is returned without calling `producer`. A payload that
    ///   fails to decode is logged and treated as a miss.
    /// - If a producer call for `key` is already running, this call waits for
    ///   it and `producer` is dropped unused.
    /// - Otherwise a flight starts on a spawned task. It reads the store once
    ///   more, since a previous flight may have finished after this caller's
    ///   read, and only then runs `producer`. A non-absent result is written
    ///   to the store for `ttl`; store failures are logged and do not fail the
    ///   call.
    ///
    /// Classified errors ([`CoalesceError::is_classified`]) reach every waiter
    /// unchanged. Other errors resolve to `Ok(None)` unless
    /// [`CacheConfig::strict_errors`] is set.
    #[instrument(skip(self, producer), fields(ttl_secs = ttl.as_secs()))]
    pub async fn get_or_set<T, F, Fut>(&self, key: &str, producer: F, ttl: Duration) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>>> + Send + 'static,
    {
        if let Some(value) = self.lookup::<T>(key).await {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key, "Cache hit");
            return Ok(Some(value));
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let flight = self.join_or_start(key, producer, ttl);

        match flight.await? {
            Some(payload) => match serde_json::from_slice(&payload) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    // Two callers used one key for different types
                    warn!(key, error = %e, "Shared result does not decode as the requested type");
                    if self.config.strict_errors {
                        Err(CoalesceError::Deserialization(e.to_string()))
                    } else {
                        Ok(None)
                    }
                }
            },
            None => Ok(None),
        }
    }

    /// [`get_or_set`](Self::get_or_set) with [`CacheConfig::default_ttl_seconds`].
    pub async fn get_or_set_default<T, F, Fut>(&self, key: &str, producer: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>>> + Send + 'static,
    {
        let ttl = Duration::from_secs(self.config.default_ttl_seconds);
        self.get_or_set(key, producer, ttl).await
    }

    /// Deletes `key` from the store.
    ///
    /// A producer call already in flight for `key` is left alone and may
    /// repopulate the entry when it completes. Invalidate after the mutation
    /// that made the value stale has committed.
    #[instrument(skip(self))]
    pub async fn invalidate(&self, key: &str) -> Result<()> {
        self.store.del(key).await.map_err(|e| {
            self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
            warn!(key, error = %e, "Failed to invalidate cache entry");
            e
        })?;
        debug!(key, "Invalidated");
        Ok(())
    }

    /// Number of producer calls currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Returns true if a producer call for `key` is in flight.
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.contains_key(key)
    }

    /// Returns a snapshot of cache activity.
    pub fn stats(&self) -> FlightStats {
        let c = &self.counters;
        FlightStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            joined: c.joined.load(Ordering::Relaxed),
            producer_calls: c.producer_calls.load(Ordering::Relaxed),
            store_errors: c.store_errors.load(Ordering::Relaxed),
            corrupt_entries: c.corrupt_entries.load(Ordering::Relaxed),
        }
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let payload = match self.store.get(key).await {
            Ok(Some(payload)) => payload,
            Ok(None) => return None,
            Err(e) => {
                self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key, error = %e, "Cache store read failed, fetching directly");
                return None;
            }
        };

        match serde_json::from_slice(&payload) {
            Ok(value) => Some(value),
            Err(e) => {
                self.counters.corrupt_entries.fetch_add(1, Ordering::Relaxed);
                warn!(key, error = %e, "Corrupt cache payload, treating as miss");
                None
            }
        }
    }

    /// Attaches to the running flight for `key` or starts a new one.
    ///
    /// The table entry is locked only for the check-and-insert; the producer
    /// is invoked after the lock is released.
    fn join_or_start<T, F, Fut>(&self, key: &str, producer: F, ttl: Duration) -> Flight
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel::<FlightOutcome>();

        let flight = match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(existing) => {
                self.counters.joined.fetch_add(1, Ordering::Relaxed);
                debug!(key, "Joining in-flight request");
                return existing.get().clone();
            }
            Entry::Vacant(slot) => {
                let flight: Flight = rx
                    .map(|received| {
                        received.unwrap_or_else(|_| {
                            warn!("Producer task ended without a result");
                            Ok(None)
                        })
                    })
                    .boxed()
                    .shared();
                slot.insert(flight.clone());
                flight
            }
        };

        debug!(key, "Cache miss, starting flight");

        let guard = FlightGuard {
            table: self.in_flight.clone(),
            key: key.to_string(),
        };
        let run = Producer {
            store: self.store.clone(),
            counters: self.counters.clone(),
            key: key.to_string(),
            ttl,
            strict: self.config.strict_errors,
        };
        let work = producer();

        tokio::spawn(async move {
            let outcome = run.complete(work).await;
            drop(guard);
            let _ = tx.send(outcome);
        });

        flight
    }
}

/// Everything the spawned producer task needs once the caller is gone.
struct Producer {
    store: Arc<dyn CacheStore>,
    counters: Arc<Counters>,
    key: String,
    ttl: Duration,
    strict: bool,
}

impl Producer {
    async fn complete<T, Fut>(self, work: Fut) -> FlightOutcome
    where
        T: Serialize + DeserializeOwned,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let key = self.key.as_str();

        // A flight that finished between the caller's read and this one
        // leaves its value in the store.
        if let Some(payload) = self.stored::<T>().await {
            debug!(key, "Filled by a previous flight, producer skipped");
            return Ok(Some(payload));
        }

        self.counters.producer_calls.fetch_add(1, Ordering::Relaxed);
        let value = match work.await {
            Ok(Some(value)) => value,
            Ok(None) => {
                debug!(key, "Producer returned nothing, not caching");
                return Ok(None);
            }
            Err(e) => return self.fail(e),
        };

        let payload = match serde_json::to_vec(&value) {
            Ok(payload) => payload,
            Err(e) => return self.fail(CoalesceError::Serialization(e.to_string())),
        };
        let shared = Bytes::copy_from_slice(&payload);

        if let Err(e) = self.store.set(key, payload, self.ttl).await {
            self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
            warn!(key, error = %e, "Cache store write failed, serving uncached value");
        } else {
            debug!(key, bytes = shared.len(), "Cached producer result");
        }

        Ok(Some(shared))
    }

    async fn stored<T: DeserializeOwned>(&self) -> Option<Bytes> {
        match self.store.get(&self.key).await {
            Ok(Some(payload)) if serde_json::from_slice::<T>(&payload).is_ok() => Some(Bytes::from(payload)),
            Ok(_) => None,
            Err(e) => {
                debug!(key = %self.key, error = %e, "Store re-check failed");
                None
            }
        }
    }

    fn fail(&self, err: CoalesceError) -> FlightOutcome {
        if err.is_classified() || self.strict {
            debug!(key = %self.key, error = %err, "Producer failed");
            Err(err)
        } else {
            warn!(key = %self.key, error = %err, "Unexpected producer error, resolving to absent");
            Ok(None)
        }
    }
}
