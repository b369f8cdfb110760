//! # Coalesce Fetch
//!
//! Upstream fetching for coalesce producers.
//!
//! - **Retry**: Bounded attempts with linear backoff; terminal failures return at once
//! - **HTTP**: Status and transport classification for `reqwest` responses
//! - **Batch**: Concurrency-bounded, paced groups that preserve input order
//! - **Source**: Single-flight cache lookups backed by retried fetches
//!
//! ## Example
//!
//! ```rust,ignore
//! use coalesce_fetch::{CachedSource, get_json};
//!
//! let source = CachedSource::with_defaults(cache);
//! let key = CacheKey::place(GEOCODE_NAMESPACE, "Kyoto");
//! let body: Option<serde_json::Value> = source
//!     .get(&key, ttl, "geocode", move |_| get_json(&client, url.clone()))
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

mod batch;
mod http;
mod retry;
mod source;

pub use batch::{BatchConfig, BatchPlan, BatchScheduler};
pub use http::{build_client, classify_status, classify_transport, get_json};
pub use retry::{AttemptError, FetchAttempt, FetchReport, RetryConfig, RetryableFetcher};
pub use source::CachedSource;
