//! Coalesce CLI
//!
//! Command-line front end for the coalesce cache: cached geocoding and weather
//! lookups, and a stampede demonstration of single-flight deduplication.

mod config;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use coalesce_cache::{MemoryStore, SingleFlightCache};
use coalesce_core::error::CoalesceError;
use coalesce_fetch::CachedSource;
use coalesce_geo::{CurrentConditions, GeoLocation, Geocoder, WeatherService};

use crate::config::AppConfig;

/// Coalesce - single-flight caching for rate-limited upstreams
#[derive(Parser)]
#[command(name = "coalesce")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve place names to coordinates
    Geocode {
        /// Place names, e.g. "Kyoto" "New York, NY"
        #[arg(required = true)]
        places: Vec<String>,
    },

    /// Show current conditions at a coordinate
    Weather {
        /// Latitude in degrees
        #[arg(long, allow_negative_numbers = true)]
        lat: f64,
        /// Longitude in degrees
        #[arg(long, allow_negative_numbers = true)]
        lng: f64,
    },

    /// Show current conditions for many coordinates
    WeatherBatch {
        /// Coordinates as LAT,LNG
        #[arg(required = true, allow_hyphen_values = true, value_parser = parse_coordinate)]
        coordinates: Vec<(f64, f64)>,
    },

    /// Fire many concurrent lookups of one key and count producer calls
    Stampede {
        /// Number of concurrent callers
        #[arg(short, long, default_value = "100")]
        callers: usize,
        /// Simulated upstream latency in milliseconds
        #[arg(short, long, default_value = "250")]
        latency_ms: u64,
    },

    /// Print the effective configuration as JSON
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "coalesce=debug,info"
    } else {
        "coalesce=info,warn"
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env().context("Invalid configuration")?;

    match cli.command {
        Commands::Geocode { places } => cmd_geocode(&config, places).await,
        Commands::Weather { lat, lng } => cmd_weather(&config, lat, lng).await,
        Commands::WeatherBatch { coordinates } => cmd_weather_batch(&config, coordinates).await,
        Commands::Stampede { callers, latency_ms } => cmd_stampede(&config, callers, latency_ms).await,
        Commands::Config => cmd_config(&config),
    }
}

fn parse_coordinate(raw: &str) -> std::result::Result<(f64, f64), String> {
    let (lat, lng) = raw
        .split_once(',')
        .ok_or_else(|| format!("expected LAT,LNG, got '{}'", raw))?;
    let lat = lat.trim().parse().map_err(|e| format!("bad latitude '{}': {}", lat, e))?;
    let lng = lng.trim().parse().map_err(|e| format!("bad longitude '{}': {}", lng, e))?;
    Ok((lat, lng))
}

/// One cache shared by every adapter in this process.
fn build_source(config: &AppConfig) -> CachedSource {
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(SingleFlightCache::with_config(store, config.cache.clone()));
    CachedSource::new(cache, config.retry.clone(), config.batch.clone())
}

fn print_location(place: &str, location: Option<&GeoLocation>) {
    match location {
        Some(loc) => {
            println!("   {} {}", "✓".green(), loc.formatted_address.bold());
            println!("     {} {:.6}, {:.6}", "lat/lng:".dimmed(), loc.lat, loc.lng);
        }
        None => println!("   {} {} {}", "✗".yellow(), place, "location not found".yellow()),
    }
}

fn print_conditions(lat: f64, lng: f64, conditions: Option<&CurrentConditions>) {
    match conditions {
        Some(c) => {
            let name = c.location_name.as_deref().unwrap_or("unnamed");
            println!("   {} {} ({:.4}, {:.4})", "✓".green(), name.bold(), lat, lng);
            println!(
                "     {:.1}°  {}  humidity {:.0}%  wind {:.1}",
                c.temperature, c.description, c.humidity, c.wind_speed
            );
        }
        None => println!("   {} ({}, {}) {}", "✗".yellow(), lat, lng, "no reading".yellow()),
    }
}

/// Resolve place names
async fn cmd_geocode(config: &AppConfig, places: Vec<String>) -> Result<()> {
    if config.geocoding.api_key.is_empty() {
        bail!("GEOCODING_API_KEY is not set");
    }
    println!("{} {} place(s)", "🔍 Geocoding".cyan().bold(), places.len());

    let geocoder = Geocoder::new(config.geocoding.clone(), build_source(config))?;

    let results = match geocoder.geocode_many(places.clone()).await {
        Ok(results) => results,
        Err(e) if e.is_terminal() => {
            // Refusals surface to the user as "not found"
            println!("   {} {}", "✗".yellow(), "location not found".yellow());
            println!("     {}", e.to_string().dimmed());
            return Ok(());
        }
        Err(e) => return Err(e).context("Geocoding failed"),
    };

    for (place, location) in places.iter().zip(&results) {
        print_location(place, location.as_ref());
    }
    Ok(())
}

/// Current conditions at one coordinate
async fn cmd_weather(config: &AppConfig, lat: f64, lng: f64) -> Result<()> {
    if config.weather.api_key.is_empty() {
        bail!("WEATHER_API_KEY is not set");
    }
    println!("{} ({}, {})", "🌤  Fetching weather at".cyan().bold(), lat, lng);

    let service = WeatherService::new(config.weather.clone(), build_source(config))?;
    let conditions = service
        .current(lat, lng)
        .await
        .context("Weather lookup failed")?;

    print_conditions(lat, lng, conditions.as_ref());
    Ok(())
}

/// Current conditions at many coordinates
async fn cmd_weather_batch(config: &AppConfig, coordinates: Vec<(f64, f64)>) -> Result<()> {
    if config.weather.api_key.is_empty() {
        bail!("WEATHER_API_KEY is not set");
    }
    println!(
        "{} {} coordinate(s), {} at a time",
        "🌤  Fetching weather for".cyan().bold(),
        coordinates.len(),
        config.batch.concurrency_limit
    );

    let service = WeatherService::new(config.weather.clone(), build_source(config))?;

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("   {spinner:.green} {msg} [{elapsed}]")?);
    spinner.set_message("fetching");
    spinner.enable_steady_tick(Duration::from_millis(100));

    let results = service.current_many(coordinates.clone()).await;
    spinner.finish_and_clear();
    let results = results.context("Batch weather lookup failed")?;

    for (&(lat, lng), conditions) in coordinates.iter().zip(&results) {
        print_conditions(lat, lng, conditions.as_ref());
    }
    Ok(())
}

/// Single-flight demonstration against a simulated upstream
async fn cmd_stampede(config: &AppConfig, callers: usize, latency_ms: u64) -> Result<()> {
    println!(
        "{} {} callers, {}ms upstream latency",
        "🐘 Stampede:".cyan().bold(),
        callers,
        latency_ms
    );

    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(SingleFlightCache::with_config(store, config.cache.clone()));
    let upstream_calls = Arc::new(AtomicU64::new(0));
    let latency = Duration::from_millis(latency_ms);
    let key = "stampede:demo";

    let pb = ProgressBar::new(callers as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("   [{bar:40.cyan/blue}] {pos}/{len}")?
            .progress_chars("#>-"),
    );

    let start = Instant::now();
    let mut handles = Vec::with_capacity(callers);
    for caller in 0..callers {
        let cache = cache.clone();
        let upstream_calls = upstream_calls.clone();
        let pb = pb.clone();
        handles.push(tokio::spawn(async move {
            let value = cache
                .get_or_set(
                    key,
                    move || async move {
                        let call = upstream_calls.fetch_add(1, Ordering::SeqCst) + 1;
                        tokio::time::sleep(latency).await;
                        Ok::<_, CoalesceError>(Some(format!("computed by caller {} (call #{})", caller, call)))
                    },
                    Duration::from_secs(60),
                )
                .await;
            pb.inc(1);
            value
        }));
    }

    let mut answers = Vec::with_capacity(callers);
    for handle in handles {
        answers.push(handle.await?.context("Cache lookup failed")?);
    }
    pb.finish();
    let elapsed = start.elapsed();

    let calls = upstream_calls.load(Ordering::SeqCst);
    let distinct = answers.iter().collect::<HashSet<_>>().len();
    let stats = cache.stats();

    println!("\n{}", "📈 Results:".green().bold());
    println!("   Upstream calls: {}", calls);
    println!("   Distinct answers: {}", distinct);
    println!("   Joined waiters: {}", stats.joined);
    println!("   Wall time: {:?}", elapsed);

    if calls == 1 {
        println!("   {} {} callers shared one upstream call", "✅".green(), callers);
    } else {
        println!("   {} Expected 1 upstream call, saw {}", "❌".red(), calls);
    }

    Ok(())
}

/// Print the effective configuration
fn cmd_config(config: &AppConfig) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    println!("\n{}", "API keys are never printed.".dimmed());
    println!(
        "   {} {}",
        "GEOCODING_API_KEY:".dimmed(),
        if config.geocoding.api_key.is_empty() { "unset".red() } else { "set".green() }
    );
    println!(
        "   {} {}",
        "WEATHER_API_KEY:".dimmed(),
        if config.weather.api_key.is_empty() { "unset".red() } else { "set".green() }
    );
    Ok(())
}
