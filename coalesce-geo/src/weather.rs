//! Current conditions from an OpenWeather-style API.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use url::Url;

use coalesce_core::constants::{ttl_seconds, DEFAULT_HTTP_TIMEOUT_SECONDS, WEATHER_NAMESPACE, WEATHER_TTL_SECONDS};
use coalesce_core::error::{CoalesceError, Result, TerminalReason};
use coalesce_core::keys::CacheKey;
use coalesce_fetch::{build_client, get_json, AttemptError, CachedSource};

/// Default current-weather endpoint.
const DEFAULT_WEATHER_URL: &str = "https://api.openweathermap.org/data/2.5/weather";

/// Weather service configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WeatherConfig {
    /// Endpoint URL
    pub base_url: String,
    /// API key sent as the `appid` query parameter
    #[serde(default, skip_serializing)]
    pub api_key: String,
    /// Unit system requested from the upstream
    pub units: String,
    /// Request timeout in seconds
    pub timeout_seconds: u64,
    /// How long a reading stays cached
    pub ttl_seconds: u64,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_WEATHER_URL.into(),
            api_key: String::new(),
            units: "metric".into(),
            timeout_seconds: DEFAULT_HTTP_TIMEOUT_SECONDS,
            ttl_seconds: WEATHER_TTL_SECONDS,
        }
    }
}

impl WeatherConfig {
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

    /// Overrides the unit system (`metric`, `imperial`, `standard`).
    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = units.into();
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
            .map_err(|e| CoalesceError::Config(format!("Invalid weather URL '{}': {}", self.base_url, e)))?;
        if self.ttl_seconds == 0 {
            return Err(CoalesceError::Config("Weather ttl_seconds must be at least 1".into()));
        }
        Ok(())
    }
}

/// Current conditions at a coordinate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CurrentConditions {
    /// Temperature in the configured units
    pub temperature: f64,
    /// Relative humidity in percent
    pub humidity: f64,
    /// Short description, e.g. "light rain"
    pub description: String,
    /// Wind speed in the configured units
    pub wind_speed: f64,
    /// Upstream's name for the nearest station, if any
    pub location_name: Option<String>,
    /// When the upstream observed these conditions
    pub observed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct WeatherResponse {
    main: MainReading,
    #[serde(default)]
    weather: Vec<WeatherSummary>,
    wind: Wind,
    #[serde(default)]
    name: Option<String>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    dt: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct MainReading {
    temp: f64,
    humidity: f64,
}

#[derive(Debug, Deserialize)]
struct WeatherSummary {
    description: String,
}

#[derive(Debug, Deserialize)]
struct Wind {
    speed: f64,
}

impl WeatherResponse {
    fn into_conditions(self) -> std::result::Result<CurrentConditions, AttemptError> {
        let description = self
            .weather
            .into_iter()
            .next()
            .map(|w| w.description)
            .ok_or_else(|| AttemptError::Malformed("response without weather[0]".into()))?;

        Ok(CurrentConditions {
            temperature: self.main.temp,
            humidity: self.main.humidity,
            description,
            wind_speed: self.wind.speed,
            location_name: self.name.filter(|n| !n.is_empty()),
            observed_at: self.dt,
        })
    }
}

/// Cached, single-flight current-conditions lookup.
///
/// Readings are cached under `weather_data_raw:{lat}_{lng}` with coordinates
/// truncated to six decimal places, so nearby lookups that agree to that
/// precision share one entry and one upstream call.
pub struct WeatherService {
    config: WeatherConfig,
    source: CachedSource,
    http_client: reqwest::Client,
}

impl WeatherService {
    /// Creates a service that fetches through `source`.
    pub fn new(config: WeatherConfig, source: CachedSource) -> Result<Self> {
        config.validate()?;
        let http_client = build_client(Duration::from_secs(config.timeout_seconds))?;
        Ok(Self {
            config,
            source,
            http_client,
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &WeatherConfig {
        &self.config
    }

    /// Cache key for a coordinate pair.
    pub fn cache_key(lat: f64, lng: f64) -> CacheKey {
        CacheKey::coordinates(WEATHER_NAMESPACE, lat, lng)
    }

    /// Returns current conditions at (`lat`, `lng`).
    ///
    /// Out-of-range coordinates are rejected without calling the upstream.
    #[instrument(skip(self))]
    pub async fn current(&self, lat: f64, lng: f64) -> Result<Option<CurrentConditions>> {
        check_coordinates(lat, lng)?;

        let url = self.request_url(lat, lng)?;
        let client = self.http_client.clone();
        let ttl = Duration::from_secs(self.config.ttl_seconds);

        let conditions = self
            .source
            .get(&Self::cache_key(lat, lng), ttl, "weather", move |_| {
                let client = client.clone();
                let url = url.clone();
                async move {
                    let response: WeatherResponse = get_json(&client, url).await?;
                    response.into_conditions()
                }
            })
            .await?;

        if let Some(c) = &conditions {
            info!(lat, lng, temperature = c.temperature, "Current conditions");
        }
        Ok(conditions)
    }

    /// Returns current conditions for many coordinates in paced groups,
    /// keeping input order. The first failure aborts the batch.
    #[instrument(skip_all, fields(coordinates = coordinates.len()))]
    pub async fn current_many(&self, coordinates: Vec<(f64, f64)>) -> Result<Vec<Option<CurrentConditions>>> {
        for &(lat, lng) in &coordinates {
            check_coordinates(lat, lng)?;
        }

        let requests = coordinates
            .into_iter()
            .map(|(lat, lng)| self.request_url(lat, lng).map(|url| (lat, lng, url)))
            .collect::<Result<Vec<_>>>()?;
        let client = self.http_client.clone();
        let ttl = Duration::from_secs(self.config.ttl_seconds);

        self.source
            .get_many(
                requests,
                |&(lat, lng, _)| Self::cache_key(lat, lng),
                ttl,
                "weather",
                |(_, _, url)| {
                    let client = client.clone();
                    move |_: u32| {
                        let client = client.clone();
                        let url = url.clone();
                        async move {
                            let response: WeatherResponse = get_json(&client, url).await?;
                            response.into_conditions()
                        }
                    }
                },
            )
            .await
    }

    /// Drops the cached reading for (`lat`, `lng`).
    pub async fn invalidate(&self, lat: f64, lng: f64) -> Result<()> {
        self.source.invalidate(&Self::cache_key(lat, lng)).await
    }

    fn request_url(&self, lat: f64, lng: f64) -> Result<Url> {
        Url::parse_with_params(
            &self.config.base_url,
            &[
                ("lat", lat.to_string()),
                ("lon", lng.to_string()),
                ("appid", self.config.api_key.clone()),
                ("units", self.config.units.clone()),
            ],
        )
        .map_err(|e| CoalesceError::Config(format!("Invalid weather URL: {}", e)))
    }
}

fn check_coordinates(lat: f64, lng: f64) -> Result<()> {
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
        return Err(CoalesceError::TerminalUpstream {
            reason: TerminalReason::Rejected,
            message: format!("coordinates out of range: {}, {}", lat, lng),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use coalesce_cache::{MemoryStore, SingleFlightCache};
    use coalesce_fetch::{BatchConfig, RetryConfig};
    use serde_json::json;
    use std::sync::Arc;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn reading(temp: f64) -> serde_json::Value {
        json!({
            "main": { "temp": temp, "humidity": 72 },
            "weather": [{ "description": "light rain" }],
            "wind": { "speed": 3.6 },
            "name": "Kyoto",
            "dt": 1_700_000_000
        })
    }

    async fn setup() -> (MockServer, Arc<MemoryStore>, WeatherService) {
        let server = MockServer::start().await;
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(SingleFlightCache::new(store.clone()));
        let source = CachedSource::new(
            cache,
            RetryConfig::new(3, Duration::from_millis(10)),
            BatchConfig::new(2, Duration::from_millis(5)),
        );
        let config = WeatherConfig::new("test-key").with_base_url(format!("{}/data/2.5/weather", server.uri()));
        let service = WeatherService::new(config, source).unwrap();
        (server, store, service)
    }

    #[test]
    fn test_cache_key_truncates_coordinates() {
        assert_eq!(
            WeatherService::cache_key(35.0, 135.0).as_str(),
            "weather_data_raw:35.000000_135.000000"
        );
        assert_eq!(
            WeatherService::cache_key(35.01163619, 135.76802951),
            WeatherService::cache_key(35.01163611, 135.76802999)
        );
    }

    #[test]
    fn test_config_ttl() {
        let config = WeatherConfig::new("k").with_ttl(Duration::from_millis(1500));
        assert_eq!(config.ttl_seconds, 2);
        assert!(config.validate().is_ok());

        let mut zero = WeatherConfig::new("k");
        zero.ttl_seconds = 0;
        assert!(matches!(zero.validate(), Err(CoalesceError::Config(_))));
    }

    #[test]
    fn test_coordinate_range_check() {
        assert!(check_coordinates(35.0, 135.0).is_ok());
        assert!(check_coordinates(-90.0, 180.0).is_ok());
        assert!(check_coordinates(91.0, 0.0).is_err());
        assert!(check_coordinates(0.0, -181.0).is_err());
        assert!(check_coordinates(f64::NAN, 0.0).is_err());
    }

    #[tokio::test]
    async fn test_current_parses_and_caches() {
        let (server, store, service) = setup().await;
        Mock::given(method("GET"))
            .and(path("/data/2.5/weather"))
            .and(query_param("lat", "35"))
            .and(query_param("lon", "135"))
            .and(query_param("appid", "test-key"))
            .and(query_param("units", "metric"))
            .respond_with(ResponseTemplate::new(200).set_body_json(reading(18.4)))
            .expect(1)
            .mount(&server)
            .await;

        let conditions = service.current(35.0, 135.0).await.unwrap().unwrap();
        assert_eq!(conditions.temperature, 18.4);
        assert_eq!(conditions.humidity, 72.0);
        assert_eq!(conditions.description, "light rain");
        assert_eq!(conditions.wind_speed, 3.6);
        assert_eq!(conditions.location_name.as_deref(), Some("Kyoto"));
        assert_eq!(conditions.observed_at.map(|t| t.timestamp()), Some(1_700_000_000));

        let again = service.current(35.0, 135.0).await.unwrap();
        assert_eq!(again, Some(conditions));
        assert!(store.peek("weather_data_raw:35.000000_135.000000").is_some());
    }

    #[tokio::test]
    async fn test_concurrent_readings_share_one_request() {
        let (server, _store, service) = setup().await;
        Mock::given(method("GET"))
            .and(path("/data/2.5/weather"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(reading(18.4))
                    .set_delay(Duration::from_millis(100)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let (a, b) = tokio::join!(service.current(35.0, 135.0), service.current(35.0, 135.0));
        assert_eq!(a.unwrap(), b.unwrap());
    }

    #[tokio::test]
    async fn test_missing_fields_retry_then_fail() {
        let (server, store, service) = setup().await;
        Mock::given(method("GET"))
            .and(path("/data/2.5/weather"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "main": { "temp": 1.0 } })))
            .expect(3)
            .mount(&server)
            .await;

        let err = service.current(35.0, 135.0).await.unwrap_err();
        match err {
            CoalesceError::UpstreamService { operation, attempts, .. } => {
                assert_eq!(operation, "weather");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_key_is_terminal() {
        let (server, _store, service) = setup().await;
        Mock::given(method("GET"))
            .and(path("/data/2.5/weather"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "cod": 401, "message": "Invalid API key" })))
            .expect(1)
            .mount(&server)
            .await;

        let err = service.current(35.0, 135.0).await.unwrap_err();
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_server_error_recovers() {
        let (server, _store, service) = setup().await;
        Mock::given(method("GET"))
            .and(path("/data/2.5/weather"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/data/2.5/weather"))
            .respond_with(ResponseTemplate::new(200).set_body_json(reading(9.0)))
            .mount(&server)
            .await;

        let conditions = service.current(35.0, 135.0).await.unwrap().unwrap();
        assert_eq!(conditions.temperature, 9.0);
    }

    #[tokio::test]
    async fn test_current_many_keeps_order() {
        let (server, _store, service) = setup().await;
        for (lat, temp) in [("10", 10.0), ("20", 20.0), ("30", 30.0)] {
            Mock::given(method("GET"))
                .and(path("/data/2.5/weather"))
                .and(query_param("lat", lat))
                .respond_with(ResponseTemplate::new(200).set_body_json(reading(temp)))
                .mount(&server)
                .await;
        }

        let readings = service
            .current_many(vec![(30.0, 0.0), (10.0, 0.0), (20.0, 0.0)])
            .await
            .unwrap();

        let temps: Vec<f64> = readings.into_iter().map(|r| r.unwrap().temperature).collect();
        assert_eq!(temps, vec![30.0, 10.0, 20.0]);
    }

    #[tokio::test]
    async fn test_current_many_rejects_bad_coordinates_up_front() {
        let (_server, _store, service) = setup().await;
        let err = service.current_many(vec![(0.0, 0.0), (100.0, 0.0)]).await.unwrap_err();
        assert!(matches!(
            err,
            CoalesceError::TerminalUpstream {
                reason: TerminalReason::Rejected,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let (server, store, service) = setup().await;
        Mock::given(method("GET"))
            .and(path("/data/2.5/weather"))
            .respond_with(ResponseTemplate::new(200).set_body_json(reading(18.4)))
            .expect(2)
            .mount(&server)
            .await;

        service.current(35.0, 135.0).await.unwrap();
        service.invalidate(35.0, 135.0).await.unwrap();
        assert!(store.peek("weather_data_raw:35.000000_135.000000").is_none());
        service.current(35.0, 135.0).await.unwrap();
    }
}
