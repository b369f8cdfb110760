//! # Coalesce Geo
//!
//! Cached geocoding and weather adapters.
//!
//! Both adapters fetch through a shared [`coalesce_fetch::CachedSource`], so
//! concurrent lookups of one place or coordinate make a single upstream call
//! and rate-limited upstreams are retried with backoff.
//!
//! ```rust,ignore
//! let geocoder = Geocoder::new(GeocodingConfig::new(api_key), source.clone())?;
//! if let Some(place) = geocoder.geocode("Kyoto").await? {
//!     let weather = WeatherService::new(WeatherConfig::new(weather_key), source)?;
//!     let now = weather.current(place.lat, place.lng).await?;
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

mod geocode;
mod weather;

pub use geocode::{GeoLocation, Geocoder, GeocodingConfig};
pub use weather::{CurrentConditions, WeatherConfig, WeatherService};
