/// Application name
pub const APP_NAME: &str = "Parley";

/// Maximum number of resident profile cache entries
pub const PROFILE_CACHE_CAPACITY: usize = 100;

/// Profile cache time-to-live in seconds (30 minutes)
pub const PROFILE_CACHE_TTL_SECS: u64 = 30 * 60;

/// Profile fetch timeout in milliseconds
pub const PROFILE_FETCH_TIMEOUT_MS: u64 = 10_000;

/// Display name shown for a sender whose profile cannot be loaded
pub const PLACEHOLDER_DISPLAY_NAME: &str = "removed user";

/// First reconnect delay in milliseconds
pub const RECONNECT_BASE_DELAY_MS: u64 = 500;

/// Upper bound on the reconnect delay in milliseconds
pub const RECONNECT_MAX_DELAY_MS: u64 = 30_000;

/// Capacity of the engine and transport mpsc channels
pub const CHANNEL_CAPACITY: usize = 256;

/// Interval between expired profile purges in seconds
pub const PROFILE_PURGE_INTERVAL_SECS: u64 = 300;
