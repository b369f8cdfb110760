//! Place-name geocoding against a Google-style geocoding API.
//!
//! The upstream reports most outcomes in a `status` field of a 200 response,
//! so the status is classified here in addition to the HTTP status.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use url::Url;

use coalesce_core::constants::{ttl_seconds, DEFAULT_HTTP_TIMEOUT_SECONDS, GEOCODE_NAMESPACE, GEOCODE_TTL_SECONDS};
use coalesce_core::error::{CoalesceError, Result, TerminalReason};
use coalesce_core::keys::CacheKey;
use coalesce_fetch::{build_client, get_json, AttemptError, CachedSource};

/// Default geocoding endpoint.
const DEFAULT_GEOCODING_URL: &str = "https://maps.googleapis.com/maps/api/geocode/json";

/// Geocoder configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GeocodingConfig {
    /// Endpoint URL
    pub base_url: String,
    /// API key sent as the `key` query parameter
    #[serde(default, skip_serializing)]
    pub api_key: String,
    /// Request timeout in seconds
    pub timeout_seconds: u64,
    /// How long a resolved location stays cached
    pub ttl_seconds: u64,
}

impl Default for GeocodingConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_GEOCODING_URL.into(),
            api_key: String::new(),
            timeout_seconds: DEFAULT_HTTP_TIMEOUT_SECONDS,
            ttl_seconds: GEOCODE_TTL_SECONDS,
        }
    }
}

impl GeocodingConfig {
    /// Creates a configuration with the given API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Default::default()
        }
    }

    /// Overrides the endpoint URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Overrides the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_seconds = timeout.as_secs().max(1);
        self
    }

    /// Overrides the cache TTL, rounded up to whole seconds.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_seconds = ttl_seconds(ttl);
        self
    }

    /// Checks that the endpoint parses and the TTL is non-zero.
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.base_url)
            .map_err(|e| CoalesceError::Config(format!("Invalid geocoding URL '{}': {}", self.base_url, e)))?;
        if self.ttl_seconds == 0 {
            return Err(CoalesceError::Config("Geocoding ttl_seconds must be at least 1".into()));
        }
        Ok(())
    }
}

/// A resolved place.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    /// Latitude in degrees
    pub lat: f64,
    /// Longitude in degrees
    pub lng: f64,
    /// Upstream's canonical name for the place
    pub formatted_address: String,
}

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    results: Vec<GeocodeResult>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResult {
    formatted_address: Option<String>,
    geometry: Option<Geometry>,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    location: LatLng,
}

#[derive(Debug, Deserialize)]
struct LatLng {
    lat: f64,
    lng: f64,
}

impl GeocodeResponse {
    /// Classifies the upstream `status` and extracts the first result.
    fn into_location(self) -> std::result::Result<GeoLocation, AttemptError> {
        let detail = || match &self.error_message {
            Some(message) => format!("{}: {}", self.status, message),
            None => self.status.clone(),
        };

        match self.status.as_str() {
            "OK" => {}
            "ZERO_RESULTS" => return Err(AttemptError::not_found(detail())),
            "REQUEST_DENIED" => {
                return Err(AttemptError::terminal(TerminalReason::Unauthorized, detail()))
            }
            "INVALID_REQUEST" => {
                return Err(AttemptError::terminal(TerminalReason::Rejected, detail()))
            }
            "OVER_QUERY_LIMIT" => return Err(AttemptError::RateLimited(detail())),
            _ => return Err(AttemptError::Upstream(detail())),
        }

        let first = self
            .results
            .into_iter()
            .next()
            .ok_or_else(|| AttemptError::Malformed("OK response without results".into()))?;
        let location = first
            .geometry
            .ok_or_else(|| AttemptError::Malformed("result without geometry".into()))?
            .location;
        let formatted_address = first
            .formatted_address
            .ok_or_else(|| AttemptError::Malformed("result without formatted_address".into()))?;

        Ok(GeoLocation {
            lat: location.lat,
            lng: location.lng,
            formatted_address,
        })
    }
}

/// Cached, single-flight geocoder.
///
/// Concurrent lookups of the same place share one upstream call; resolved
/// places are cached under `geo:{place}`.
pub struct Geocoder {
    config: GeocodingConfig,
    source: CachedSource,
    http_client: reqwest::Client,
}

impl Geocoder {
    /// Creates a geocoder that fetches through `source`.
    pub fn new(config: GeocodingConfig, source: CachedSource) -> Result<Self> {
        config.validate()?;
        let http_client = build_client(Duration::from_secs(config.timeout_seconds))?;
        Ok(Self {
            config,
            source,
            http_client,
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &GeocodingConfig {
        &self.config
    }

    /// Cache key for `place`.
    pub fn cache_key(place: &str) -> CacheKey {
        CacheKey::place(GEOCODE_NAMESPACE, place)
    }

    /// Resolves `place` to coordinates.
    ///
    /// Returns `Ok(None)` when the upstream has no match; other terminal,
    /// rate-limit, and upstream failures are returned as errors.
    #[instrument(skip(self))]
    pub async fn geocode(&self, place: &str) -> Result<Option<GeoLocation>> {
        let place = place.trim();
        if place.is_empty() {
            debug!("Empty place name, nothing to look up");
            return Ok(None);
        }

        let url = self.request_url(place)?;
        let client = self.http_client.clone();
        let ttl = Duration::from_secs(self.config.ttl_seconds);

        let result = self
            .source
            .get(&Self::cache_key(place), ttl, "geocode", move |_| {
                let client = client.clone();
                let url = url.clone();
                async move {
                    let response: GeocodeResponse = get_json(&client, url).await?;
                    response.into_location()
                }
            })
            .await;

        match result {
            Ok(Some(location)) => {
                info!(place, lat = location.lat, lng = location.lng, "Geocoded");
                Ok(Some(location))
            }
            Ok(None) => Ok(None),
            Err(e) if e.is_not_found() => {
                info!(place, "Location not found");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Resolves many places in paced groups, keeping input order.
    ///
    /// Places with no match come back as `None`; any other failure aborts
    /// the batch.
    #[instrument(skip_all, fields(places = places.len()))]
    pub async fn geocode_many(&self, places: Vec<String>) -> Result<Vec<Option<GeoLocation>>> {
        self.source
            .scheduler()
            .fetch_all(places, |place| async move { self.geocode(&place).await })
            .await
    }

    /// Drops the cached location for `place`.
    pub async fn invalidate(&self, place: &str) -> Result<()> {
        self.source.invalidate(&Self::cache_key(place)).await
    }

    fn request_url(&self, place: &str) -> Result<Url> {
        Url::parse_with_params(
            &self.config.base_url,
            &[("address", place), ("key", self.config.api_key.as_str())],
        )
        .map_err(|e| CoalesceError::Config(format!("Invalid geocoding URL: {}", e)))
    }
}
