//! Environment-driven configuration for the CLI.

use std::str::FromStr;

use serde::Serialize;

use coalesce_cache::CacheConfig;
use coalesce_core::error::{CoalesceError, Result};
use coalesce_fetch::{BatchConfig, RetryConfig};
use coalesce_geo::{GeocodingConfig, WeatherConfig};

/// Effective configuration of every layer.
#[derive(Clone, Debug, Default, Serialize)]
pub struct AppConfig {
    /// Single-flight cache settings
    pub cache: CacheConfig,
    /// Retry budget and backoff
    pub retry: RetryConfig,
    /// Batch size and pacing
    pub batch: BatchConfig,
    /// Geocoding upstream
    pub geocoding: GeocodingConfig,
    /// Weather upstream
    pub weather: WeatherConfig,
}

impl AppConfig {
    /// Loads `.env` if present, then reads the process environment.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a configuration from `lookup`, starting from defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_var(&lookup, "COALESCE_MAX_ATTEMPTS")? {
            config.retry.max_attempts = v;
        }
        if let Some(v) = parse_var(&lookup, "COALESCE_BASE_DELAY_MS")? {
            config.retry.base_delay_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "COALESCE_CONCURRENCY_LIMIT")? {
            config.batch.concurrency_limit = v;
        }
        if let Some(v) = parse_var(&lookup, "COALESCE_INTER_BATCH_DELAY_MS")? {
            config.batch.inter_batch_delay_ms = v;
        }
        if let Some(raw) = lookup("COALESCE_STRICT_ERRORS") {
            config.cache.strict_errors = parse_flag("COALESCE_STRICT_ERRORS", &raw)?;
        }

        if let Some(key) = lookup("GEOCODING_API_KEY") {
            config.geocoding.api_key = key;
        }
        if let Some(url) = lookup("GEOCODING_BASE_URL") {
            config.geocoding.base_url = url;
        }
        if let Some(key) = lookup("WEATHER_API_KEY") {
            config.weather.api_key = key;
        }
        if let Some(url) = lookup("WEATHER_BASE_URL") {
            config.weather.base_url = url;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates every section.
    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        self.retry.validate()?;
        self.batch.validate()?;
        self.geocoding.validate()?;
        self.weather.validate()?;
        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, name: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| CoalesceError::Config(format!("{}='{}': {}", name, raw, e))),
    }
}

fn parse_flag(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(CoalesceError::Config(format!("{}='{}' is not a boolean", name, raw))),
    }
}
