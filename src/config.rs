use std::path::PathBuf;
use std::str::FromStr;

use crate::model::{Minute, Ms};

/// Domain tunables. Everything here used to be a literal somewhere.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Hold lifetime from creation; extensions never push past it.
    pub hold_ttl_ms: Ms,
    /// Increment granted by one extend call.
    pub extend_step_ms: Ms,
    /// Duration assumed for bookings that omit one.
    pub default_duration: Minute,
    /// Parties at least this large try join groups before single tables.
    pub large_party_threshold: u32,
    /// Age after which a cached availability scan is recomputed even
    /// without an invalidation.
    pub cache_ttl_ms: Ms,
    /// Alternative-time search reaches this far either side of the request.
    pub search_window: Minute,
    /// Default distance between alternative candidates.
    pub search_step: Minute,
    /// Shortest reduced duration still offered as a flexible option.
    pub min_flex_duration: Minute,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hold_ttl_ms: 5 * 60_000,
            extend_step_ms: 60_000,
            default_duration: 120,
            large_party_threshold: 7,
            cache_ttl_ms: 60_000,
            search_window: 120,
            search_step: 15,
            min_flex_duration: 60,
        }
    }
}

impl EngineConfig {
    pub fn hold_minutes(&self) -> i64 {
        self.hold_ttl_ms / 60_000
    }

    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            hold_ttl_ms: env_or("TABLEHOLD_HOLD_MINUTES", d.hold_ttl_ms / 60_000) * 60_000,
            extend_step_ms: env_or("TABLEHOLD_EXTEND_SECONDS", d.extend_step_ms / 1000) * 1000,
            default_duration: env_or("TABLEHOLD_DEFAULT_DURATION_MINUTES", d.default_duration),
            large_party_threshold: env_or("TABLEHOLD_LARGE_PARTY", d.large_party_threshold),
            cache_ttl_ms: env_or("TABLEHOLD_CACHE_TTL_SECONDS", d.cache_ttl_ms / 1000) * 1000,
            search_window: env_or("TABLEHOLD_SEARCH_WINDOW_MINUTES", d.search_window),
            search_step: env_or("TABLEHOLD_SEARCH_STEP_MINUTES", d.search_step),
            min_flex_duration: env_or("TABLEHOLD_MIN_FLEX_MINUTES", d.min_flex_duration),
        }
    }
}

/// Process-level settings for the server binary.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub metrics_port: Option<u16>,
    pub seed_file: Option<PathBuf>,
    pub audit_log: Option<PathBuf>,
    pub reaper_interval_secs: u64,
    pub engine: EngineConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind: std::env::var("TABLEHOLD_BIND").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_or("TABLEHOLD_PORT", 8080),
            metrics_port: std::env::var("TABLEHOLD_METRICS_PORT")
                .ok()
                .and_then(|s| s.parse().ok()),
            seed_file: std::env::var("TABLEHOLD_SEED_FILE").ok().map(PathBuf::from),
            audit_log: std::env::var("TABLEHOLD_AUDIT_LOG").ok().map(PathBuf::from),
            reaper_interval_secs: env_or("TABLEHOLD_REAPER_INTERVAL_SECONDS", 5),
            engine: EngineConfig::from_env(),
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
