//! # Coalesce Cache
//!
//! Single-flight, TTL-based caching in front of slow or rate-limited producers.
//!
//! - [`SingleFlightCache`]: at most one producer call per key in flight, every
//!   concurrent caller shares its result, successful results are stored with a TTL
//! - [`MemoryStore`]: in-process [`CacheStore`](coalesce_core::CacheStore) for tests
//!   and single-node deployments
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use coalesce_cache::{MemoryStore, SingleFlightCache};
//!
//! let cache = SingleFlightCache::new(Arc::new(MemoryStore::new()));
//! let location = cache
//!     .get_or_set("geo:Kyoto", || async { geocode("Kyoto").await }, Duration::from_secs(86_400))
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

mod flight;
mod store;

pub use flight::{CacheConfig, FlightStats, SingleFlightCache};
pub use store::{MemoryStore, MemoryStoreConfig, StoreStats};
