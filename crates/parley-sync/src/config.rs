//! Sync core configuration loaded from environment variables.
//!
//! All settings have defaults so an embedding application can start with
//! zero configuration.

use std::time::Duration;

use parley_shared::constants::{
    CHANNEL_CAPACITY, PROFILE_CACHE_CAPACITY, PROFILE_CACHE_TTL_SECS, PROFILE_FETCH_TIMEOUT_MS,
    PROFILE_PURGE_INTERVAL_SECS, RECONNECT_BASE_DELAY_MS, RECONNECT_MAX_DELAY_MS,
};

/// Profile cache limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileCacheConfig {
    /// Maximum resident entries.
    /// Env: `PARLEY_PROFILE_CACHE_CAPACITY`
    /// Default: `100`
    pub capacity: usize,

    /// Maximum age of a served entry.
    /// Env: `PARLEY_PROFILE_TTL_SECS`
    /// Default: 30 minutes
    pub ttl: Duration,

    /// A fetch running longer than this resolves to the placeholder.
    /// Env: `PARLEY_PROFILE_FETCH_TIMEOUT_MS`
    /// Default: 10 seconds
    pub fetch_timeout: Duration,
}

impl Default for ProfileCacheConfig {
    fn default() -> Self {
        Self {
            capacity: PROFILE_CACHE_CAPACITY,
            ttl: Duration::from_secs(PROFILE_CACHE_TTL_SECS),
            fetch_timeout: Duration::from_millis(PROFILE_FETCH_TIMEOUT_MS),
        }
    }
}

/// Reconnect backoff for failed subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Env: `PARLEY_RECONNECT_BASE_MS`
    /// Default: 500 ms
    pub base_delay: Duration,

    /// Env: `PARLEY_RECONNECT_MAX_MS`
    /// Default: 30 seconds
    pub max_delay: Duration,
}

impl ReconnectConfig {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(RECONNECT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(RECONNECT_MAX_DELAY_MS),
        }
    }
}

/// Top-level configuration of the sync core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    pub profile_cache: ProfileCacheConfig,
    pub reconnect: ReconnectConfig,

    /// Capacity of the engine command channel.
    /// Env: `PARLEY_CHANNEL_CAPACITY`
    /// Default: `256`
    pub channel_capacity: usize,

    /// How often expired profiles are purged.
    /// Env: `PARLEY_PROFILE_PURGE_SECS`
    /// Default: 5 minutes
    pub purge_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            profile_cache: ProfileCacheConfig::default(),
            reconnect: ReconnectConfig::default(),
            channel_capacity: CHANNEL_CAPACITY,
            purge_interval: Duration::from_secs(PROFILE_PURGE_INTERVAL_SECS),
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(n) = parse_var::<usize>(&lookup, "PARLEY_PROFILE_CACHE_CAPACITY") {
            if n == 0 {
                tracing::warn!("PARLEY_PROFILE_CACHE_CAPACITY must be positive, using default");
            } else {
                config.profile_cache.capacity = n;
            }
        }

        if let Some(secs) = parse_var::<u64>(&lookup, "PARLEY_PROFILE_TTL_SECS") {
            config.profile_cache.ttl = Duration::from_secs(secs);
        }

        if let Some(ms) = parse_var::<u64>(&lookup, "PARLEY_PROFILE_FETCH_TIMEOUT_MS") {
            config.profile_cache.fetch_timeout = Duration::from_millis(ms);
        }

        if let Some(ms) = parse_var::<u64>(&lookup, "PARLEY_RECONNECT_BASE_MS") {
            config.reconnect.base_delay = Duration::from_millis(ms);
        }

        if let Some(ms) = parse_var::<u64>(&lookup, "PARLEY_RECONNECT_MAX_MS") {
            config.reconnect.max_delay = Duration::from_millis(ms);
        }

        if let Some(n) = parse_var::<usize>(&lookup, "PARLEY_CHANNEL_CAPACITY") {
            if n > 0 {
                config.channel_capacity = n;
            }
        }

        if let Some(secs) = parse_var::<u64>(&lookup, "PARLEY_PROFILE_PURGE_SECS") {
            if secs > 0 {
                config.purge_interval = Duration::from_secs(secs);
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid configuration value, using default");
            None
        }
    }
}
