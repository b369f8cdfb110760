//! Cache-key builders.
//!
//! A key is `{namespace}:{discriminator}`. Discriminators must collide exactly
//! when two lookups are equivalent, so coordinates are truncated to a fixed
//! precision and place names are trimmed and form-encoded.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::COORDINATE_PRECISION;

/// Opaque cache key.
///
/// The cache never looks inside; these builders only exist so adapters agree
/// on one naming scheme.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wraps a raw key.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// `{namespace}:{discriminator}`.
    pub fn namespaced(namespace: &str, discriminator: impl fmt::Display) -> Self {
        Self(format!("{}:{}", namespace, discriminator))
    }

    /// Coordinate pair truncated toward zero to [`COORDINATE_PRECISION`] places,
    /// e.g. `weather_data_raw:35.000000_135.000000`.
    pub fn coordinates(namespace: &str, lat: f64, lng: f64) -> Self {
        Self::namespaced(
            namespace,
            format!("{}_{}", truncate_coordinate(lat), truncate_coordinate(lng)),
        )
    }

    /// Place name, trimmed and form-encoded (`"New York"` becomes `New+York`).
    pub fn place(namespace: &str, name: &str) -> Self {
        let encoded: String = url::form_urlencoded::byte_serialize(name.trim().as_bytes()).collect();
        Self::namespaced(namespace, encoded)
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the namespace part (everything before the first `:`), if any.
    pub fn namespace(&self) -> Option<&str> {
        self.0.split_once(':').map(|(ns, _)| ns)
    }

    /// Consumes the key, returning the inner string.
    pub fn into_string(self) -> String {
        self.0
    }
}

/// Formats a coordinate truncated toward zero to [`COORDINATE_PRECISION`] places.
pub fn truncate_coordinate(value: f64) -> String {
    let scale = 10f64.powi(COORDINATE_PRECISION as i32);
    let scaled = value * scale;
    // 0.3 * 1e6 is 299999.99999999994; nudge so binary representation error
    // does not drop the last digit
    let truncated = (scaled + scaled.signum() * 1e-6).trunc() / scale;
    // -0.0 and 0.0 must share a key
    let truncated = if truncated == 0.0 { 0.0 } else { truncated };
    format!("{:.*}", COORDINATE_PRECISION, truncated)
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<String> for CacheKey {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl From<&str> for CacheKey {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{GEOCODE_NAMESPACE, WEATHER_NAMESPACE};
    use proptest::prelude::*;

    #[test]
    fn test_coordinate_key_format() {
        let key = CacheKey::coordinates(WEATHER_NAMESPACE, 35.0, 135.0);
        assert_eq!(key.as_str(), "weather_data_raw:35.000000_135.000000");
    }

    #[test]
    fn test_coordinate_key_absorbs_float_noise() {
        let a = CacheKey::coordinates(WEATHER_NAMESPACE, 35.0116361, 135.7680294);
        let b = CacheKey::coordinates(WEATHER_NAMESPACE, 35.01163619, 135.76802949);
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "weather_data_raw:35.011636_135.768029");
    }

    #[test]
    fn test_coordinate_key_negative_and_zero() {
        let key = CacheKey::coordinates(WEATHER_NAMESPACE, -33.8688197, -0.0);
        assert_eq!(key.as_str(), "weather_data_raw:-33.868819_0.000000");
    }

    #[test]
    fn test_coordinate_key_exact_decimals() {
        let key = CacheKey::coordinates(WEATHER_NAMESPACE, 0.3, 135.77);
        assert_eq!(key.as_str(), "weather_data_raw:0.300000_135.770000");
    }

    #[test]
    fn test_place_key_encoding() {
        assert_eq!(CacheKey::place(GEOCODE_NAMESPACE, "Kyoto").as_str(), "geo:Kyoto");
        assert_eq!(
            CacheKey::place(GEOCODE_NAMESPACE, "  New York, NY ").as_str(),
            "geo:New+York%2C+NY"
        );
    }

    #[test]
    fn test_namespace_accessor() {
        let key = CacheKey::place(GEOCODE_NAMESPACE, "Kyoto");
        assert_eq!(key.namespace(), Some("geo"));
        assert_eq!(CacheKey::new("bare").namespace(), None);
    }

    proptest! {
        #[test]
        fn prop_coordinate_key_has_fixed_precision(lat in -90.0f64..90.0, lng in -180.0f64..180.0) {
            let key = CacheKey::coordinates(WEATHER_NAMESPACE, lat, lng);
            let (_, disc) = key.as_str().split_once(':').unwrap();
            let (lat_s, lng_s) = disc.split_once('_').unwrap();
            for part in [lat_s, lng_s] {
                let (_, frac) = part.split_once('.').unwrap();
                prop_assert_eq!(frac.len(), COORDINATE_PRECISION);
            }
            let parsed_lat: f64 = lat_s.parse().unwrap();
            prop_assert!((parsed_lat - lat).abs() < 1e-5);
        }

        #[test]
        fn prop_place_key_has_no_raw_separators(name in "[a-zA-Z :,/]{1,32}") {
            let key = CacheKey::place(GEOCODE_NAMESPACE, &name);
            let (ns, disc) = key.as_str().split_once(':').unwrap();
            prop_assert_eq!(ns, GEOCODE_NAMESPACE);
            prop_assert!(!disc.contains(':'));
            prop_assert!(!disc.contains(' '));
        }
    }
}
