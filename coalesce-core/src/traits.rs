//! Common traits for coalesce.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

// ═══════════════════════════════════════════════════════════════════════════════
// CACHE STORE TRAIT
// ═══════════════════════════════════════════════════════════════════════════════

/// Key to serialized-value store with per-entry TTL.
///
/// The cache treats values as opaque bytes and never inspects keys.
/// Implementations might use:
/// - In-process memory (for testing/single-node deployments)
/// - A managed key-value service (Redis, Upstash, Memcached)
///
/// Only eventual consistency and best-effort durability are expected. Concurrent
/// writers to the same key resolve as "last write wins".
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Reads the value stored under `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Stores `value` under `key` for `ttl`.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    /// Deletes `key`. Deleting a missing key is not an error.
    async fn del(&self, key: &str) -> Result<()>;
}
