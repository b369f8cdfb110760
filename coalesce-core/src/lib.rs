//! # Coalesce Core
//!
//! Core types, errors, and traits shared by every coalesce crate.
//!
//! - **Errors**: The classified error taxonomy returned by producers and the cache
//! - **Keys**: Namespaced cache-key builders
//! - **Constants**: Defaults for retry, batching, and adapter TTLs
//! - **Traits**: The [`CacheStore`] interface the cache is built on
//!
//! ## Example
//!
//! ```rust
//! use coalesce_core::{CacheKey, WEATHER_NAMESPACE};
//!
//! let key = CacheKey::coordinates(WEATHER_NAMESPACE, 35.0, 135.0);
//! assert_eq!(key.as_str(), "weather_data_raw:35.000000_135.000000");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]

pub mod constants;
pub mod error;
pub mod keys;
pub mod traits;

// Re-export commonly used items at crate root
pub use constants::*;
pub use error::{CoalesceError, Result, TerminalReason};
pub use keys::CacheKey;
pub use traits::CacheStore;
