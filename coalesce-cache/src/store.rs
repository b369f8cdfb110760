//! In-memory TTL store.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use coalesce_core::constants::DEFAULT_MAX_ENTRIES;
use coalesce_core::error::Result;
use coalesce_core::traits::CacheStore;

/// Stored payload with TTL.
#[derive(Clone)]
struct StoreEntry {
    value: Vec<u8>,
    inserted_at: Instant,
    ttl: Duration,
}

impl StoreEntry {
    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() >= self.ttl
    }
}

/// Memory store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryStoreConfig {
    /// Maximum number of entries
    pub max_entries: usize,
    /// Whether to purge expired entries before evicting live ones
    pub auto_cleanup: bool,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            auto_cleanup: true,
        }
    }
}

/// In-process [`CacheStore`].
///
/// Thread-safe and supports TTL-based expiration. When full, expired entries
/// are purged first and then the oldest entry is evicted.
pub struct MemoryStore {
    entries: RwLock<HashMap<String, StoreEntry>>,
    config: MemoryStoreConfig,
}

impl MemoryStore {
    /// Creates a new store with default configuration.
    pub fn new() -> Self {
        Self::with_config(MemoryStoreConfig::default())
    }

    /// Creates a store with custom configuration.
    pub fn with_config(config: MemoryStoreConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Reads a live entry without going through the async trait.
    pub fn peek(&self, key: &str) -> Option<Vec<u8>> {
        let entries = self.entries.read();
        entries
            .get(key)
            .filter(|e| !e.is_expired())
            .map(|e| e.value.clone())
    }

    fn insert(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        let mut entries = self.entries.write();

        if !entries.contains_key(key) {
            if self.config.auto_cleanup && entries.len() >= self.config.max_entries {
                entries.retain(|_, e| !e.is_expired());
            }
            if entries.len() >= self.config.max_entries {
                if let Some(oldest_key) = entries
                    .iter()
                    .min_by_key(|(_, e)| e.inserted_at)
                    .map(|(k, _)| k.clone())
                {
                    entries.remove(&oldest_key);
                }
            }
        }

        entries.insert(
            key.to_string(),
            StoreEntry {
                value,
                inserted_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Removes an entry.
    pub fn remove(&self, key: &str) {
        self.entries.write().remove(key);
    }

    /// Clears all entries.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Removes all expired entries.
    pub fn cleanup_expired(&self) {
        self.entries.write().retain(|_, e| !e.is_expired());
    }

    /// Returns the number of entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Returns store statistics.
    pub fn stats(&self) -> StoreStats {
        let entries = self.entries.read();
        let expired = entries.values().filter(|e| e.is_expired()).count();
        StoreStats {
            total_entries: entries.len(),
            expired_entries: expired,
            valid_entries: entries.len().saturating_sub(expired),
            capacity: self.config.max_entries,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.peek(key))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.insert(key, value, ttl);
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.remove(key);
        Ok(())
    }
}

/// Store statistics.
#[derive(Clone, Debug)]
pub struct StoreStats {
    /// Entries held, expired ones included
    pub total_entries: usize,
    /// Entries past their TTL but not yet purged
    pub expired_entries: usize,
    /// Live entries
    pub valid_entries: usize,
    /// Configured maximum
    pub capacity: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn test_store_set_get() {
        let store = MemoryStore::new();
        store.set("geo:Kyoto", b"payload".to_vec(), HOUR).await.unwrap();

        let value = store.get("geo:Kyoto").await.unwrap();
        assert_eq!(value.as_deref(), Some(&b"payload"[..]));
    }

    #[tokio::test]
    async fn test_store_keys_are_opaque() {
        let store = MemoryStore::new();
        store.set("geo:Kyoto", b"a".to_vec(), HOUR).await.unwrap();

        assert!(store.get("geo:kyoto").await.unwrap().is_none());
        assert!(store.get(" geo:Kyoto").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_miss() {
        let store = MemoryStore::new();
        assert!(store.get("nonexistent").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_del() {
        let store = MemoryStore::new();
        store.set("k", b"v".to_vec(), HOUR).await.unwrap();
        store.del("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());

        // Deleting again is fine
        store.del("k").await.unwrap();
    }

    #[test]
    fn test_store_as_trait_object() {
        let store: std::sync::Arc<dyn CacheStore> = std::sync::Arc::new(MemoryStore::new());
        tokio_test::block_on(async {
            store.set("k", vec![1], HOUR).await.unwrap();
            assert_eq!(store.get("k").await.unwrap(), Some(vec![1]));
        });
    }

    #[test]
    fn test_store_clear() {
        let store = MemoryStore::new();
        store.insert("a", vec![1], HOUR);
        store.insert("b", vec![2], HOUR);
        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn test_store_ttl_expiration() {
        let store = MemoryStore::new();
        store.insert("k", vec![1], Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(10));
        assert!(store.peek("k").is_none());
    }

    #[test]
    fn test_store_overwrite_resets_ttl() {
        let store = MemoryStore::new();
        store.insert("k", vec![1], Duration::from_millis(1));
        store.insert("k", vec![2], HOUR);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(store.peek("k"), Some(vec![2]));
    }

    #[test]
    fn test_store_capacity_eviction() {
        let store = MemoryStore::with_config(MemoryStoreConfig {
            max_entries: 2,
            auto_cleanup: true,
        });
        store.insert("a", vec![1], HOUR);
        std::thread::sleep(Duration::from_millis(2));
        store.insert("b", vec![2], HOUR);
        std::thread::sleep(Duration::from_millis(2));
        store.insert("c", vec![3], HOUR);

        assert_eq!(store.len(), 2);
        assert!(store.peek("a").is_none());
        assert!(store.peek("c").is_some());
    }

    #[test]
    fn test_store_capacity_prefers_expired() {
        let store = MemoryStore::with_config(MemoryStoreConfig {
            max_entries: 2,
            auto_cleanup: true,
        });
        store.insert("old", vec![1], HOUR);
        store.insert("short", vec![2], Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(10));
        store.insert("new", vec![3], HOUR);

        assert!(store.peek("old").is_some());
        assert!(store.peek("new").is_some());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_store_stats() {
        let store = MemoryStore::new();
        store.insert("a", vec![1], HOUR);
        store.insert("b", vec![2], Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(10));

        let stats = store.stats();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.expired_entries, 1);
        assert_eq!(stats.valid_entries, 1);
        assert_eq!(stats.capacity, DEFAULT_MAX_ENTRIES);
    }

    #[test]
    fn test_store_cleanup_expired() {
        let store = MemoryStore::new();
        store.insert("a", vec![1], Duration::from_millis(1));
        store.insert("b", vec![2], HOUR);
        std::thread::sleep(Duration::from_millis(10));

        store.cleanup_expired();

        assert_eq!(store.len(), 1);
        assert!(store.peek("b").is_some());
    }
}
