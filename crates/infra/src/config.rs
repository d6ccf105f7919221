//! Configuration loading from the process environment.

use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::Duration;

/// Ceiling for minute-valued settings (one week).
const MAX_MINUTES: i64 = 7 * 24 * 60;

/// Reservation engine tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Lifetime of a fresh reservation.
    pub reservation_ttl: Duration,
    /// Upper bound accepted by `extend`.
    pub max_extend: Duration,
    /// How often the background sweeper runs.
    pub sweep_interval: StdDuration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reservation_ttl: Duration::minutes(30),
            max_extend: Duration::minutes(240),
            sweep_interval: StdDuration::from_secs(60),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let ttl = env_or("RESERVATION_TTL_MINUTES", defaults.reservation_ttl.num_minutes());
        let max_extend = env_or("RESERVATION_MAX_EXTEND_MINUTES", defaults.max_extend.num_minutes());
        let sweep = env_or("RESERVATION_SWEEP_INTERVAL_SECS", defaults.sweep_interval.as_secs());

        Self {
            reservation_ttl: Duration::minutes(positive_or(ttl, defaults.reservation_ttl.num_minutes())),
            max_extend: Duration::minutes(positive_or(max_extend, defaults.max_extend.num_minutes())),
            sweep_interval: StdDuration::from_secs(sweep.clamp(1, 86_400)),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.reservation_ttl = ttl;
        self
    }

    pub fn with_sweep_interval(mut self, interval: StdDuration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Process-level wiring: which store to use and where to listen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub engine: EngineConfig,
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub bind_addr: String,
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        Self {
            engine: EngineConfig::from_env(),
            use_persistent_stores: env_or("USE_PERSISTENT_STORES", false),
            database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.trim().is_empty()),
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
        }
    }
}

fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Debug,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, ?default, "invalid value in environment, using default");
            default
        }),
        Err(_) => default,
    }
}

fn positive_or(value: i64, default: i64) -> i64 {
    if value > 0 { value.min(MAX_MINUTES) } else { default }
}
