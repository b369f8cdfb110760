//! Defaults and naming constants for coalesce.
//!
//! Every config struct in the workspace takes its `Default` from here, so the
//! numbers live in one place.

use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// RETRY POLICY
// ═══════════════════════════════════════════════════════════════════════════════

/// Attempts per producer call, including the first one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Linear backoff unit. Attempt `i` (0-based) waits `i * DEFAULT_BASE_DELAY_MS` first.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;

// ═══════════════════════════════════════════════════════════════════════════════
// BATCHING
// ═══════════════════════════════════════════════════════════════════════════════

/// Maximum simultaneous fetches per batch group.
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 5;

/// Pause between two consecutive batch groups.
pub const DEFAULT_INTER_BATCH_DELAY_MS: u64 = 200;

// ═══════════════════════════════════════════════════════════════════════════════
// CACHE
// ═══════════════════════════════════════════════════════════════════════════════

/// TTL used by `get_or_set_default` when the caller has no opinion.
pub const DEFAULT_TTL_SECONDS: u64 = 3600;

/// Maximum entries held by the in-process store.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Converts a TTL to whole seconds, rounding up. Never returns 0, since a
/// zero TTL would expire the entry as soon as it is written.
pub fn ttl_seconds(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}

// ═══════════════════════════════════════════════════════════════════════════════
// ADAPTERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Key namespace for geocoding results.
pub const GEOCODE_NAMESPACE: &str = "geo";

/// Key namespace for raw current-weather payloads.
pub const WEATHER_NAMESPACE: &str = "weather_data_raw";

/// Geocoding results barely change; keep them for a day.
pub const GEOCODE_TTL_SECONDS: u64 = 86_400;

/// Weather goes stale quickly; keep it for fifteen minutes.
pub const WEATHER_TTL_SECONDS: u64 = 900;

/// Decimal places kept from a coordinate when it becomes part of a cache key.
/// Six places is roughly 11 cm at the equator.
pub const COORDINATE_PRECISION: usize = 6;

/// Default HTTP timeout for adapter requests.
pub const DEFAULT_HTTP_TIMEOUT_SECONDS: u64 = 10;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_ttls() {
        assert_eq!(GEOCODE_TTL_SECONDS, 24 * 60 * 60);
        assert_eq!(WEATHER_TTL_SECONDS, 15 * 60);
        assert!(WEATHER_TTL_SECONDS < GEOCODE_TTL_SECONDS);
    }

    #[test]
    fn test_namespaces_unique() {
        assert_ne!(GEOCODE_NAMESPACE, WEATHER_NAMESPACE);
        assert!(!GEOCODE_NAMESPACE.contains(':'));
        assert!(!WEATHER_NAMESPACE.contains(':'));
    }

    #[test]
    fn test_ttl_seconds_rounds_up() {
        assert_eq!(ttl_seconds(Duration::ZERO), 1);
        assert_eq!(ttl_seconds(Duration::from_millis(1)), 1);
        assert_eq!(ttl_seconds(Duration::from_millis(500)), 1);
        assert_eq!(ttl_seconds(Duration::from_secs(60)), 60);
        assert_eq!(ttl_seconds(Duration::from_millis(60_001)), 61);
    }

    #[test]
    fn test_retry_defaults() {
        assert_eq!(DEFAULT_MAX_ATTEMPTS, 3);
        assert_eq!(DEFAULT_BASE_DELAY_MS, 1000);
        assert_eq!(DEFAULT_CONCURRENCY_LIMIT, 5);
        assert_eq!(DEFAULT_INTER_BATCH_DELAY_MS, 200);
    }
}
