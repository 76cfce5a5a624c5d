//! Sync Service Configuration Settings
//!
//! Configuration types loaded from environment variables, with typed
//! defaults mirroring the gateway's documented quotas and timings.

use std::time::Duration;

/// Broker environment a shared connection is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Environment {
    /// Demo/simulated environment.
    #[default]
    Demo,
    /// Live environment (real money).
    Live,
}

impl Environment {
    /// Parse an environment from string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "LIVE" => Self::Live,
            _ => Self::Demo,
        }
    }

    /// Whether this is the live environment.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self, Self::Live)
    }

    /// Environment name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Demo => "demo",
            Self::Live => "live",
        }
    }
}

/// WebSocket connection settings.
#[derive(Debug, Clone)]
pub struct WebSocketSettings {
    /// Heartbeat ping interval.
    pub heartbeat_interval: Duration,
    /// Pong window before the connection is considered dead.
    pub heartbeat_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
    /// Ceiling on the multi-phase handshake.
    pub handshake_timeout: Duration,
    /// Outbound queue capacity per connection.
    pub outbound_capacity: usize,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(20),
            heartbeat_timeout: Duration::from_secs(60),
            reconnect_delay_initial: Duration::from_secs(2),
            reconnect_delay_max: Duration::from_secs(60),
            reconnect_delay_multiplier: 2.0,
            max_reconnect_attempts: 5,
            handshake_timeout: Duration::from_secs(120),
            outbound_capacity: 1024,
        }
    }
}

/// Per-category outbound rate limit settings.
#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    /// General traffic limit per window.
    pub default_limit: u32,
    /// Market data traffic limit per window.
    pub market_data_limit: u32,
    /// Order traffic limit per window.
    pub orders_limit: u32,
    /// Rolling window length.
    pub interval: Duration,
    /// Minimum wait once a limit is hit.
    pub min_backoff: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            default_limit: 100,
            market_data_limit: 200,
            orders_limit: 30,
            interval: Duration::from_secs(60),
            min_backoff: Duration::from_millis(500),
        }
    }
}

/// Cache TTL and persistence settings.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// TTL for market data entries.
    pub market_data_ttl: Duration,
    /// TTL for position entries.
    pub positions_ttl: Duration,
    /// TTL for order entries.
    pub orders_ttl: Duration,
    /// TTL for account entries.
    pub account_data_ttl: Duration,
    /// How often the cache is snapshotted to durable storage.
    pub persist_interval: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            market_data_ttl: Duration::from_secs(30 * 60),
            positions_ttl: Duration::from_secs(5 * 60),
            orders_ttl: Duration::from_secs(5 * 60),
            account_data_ttl: Duration::from_secs(15 * 60),
            persist_interval: Duration::from_secs(60),
        }
    }
}

/// Position reconciliation settings.
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Coalescing delay for price updates, per position.
    pub price_throttle: Duration,
    /// Coalescing delay for PnL updates, per position.
    pub pnl_throttle: Duration,
    /// Coalescing delay for bulk updates.
    pub bulk_throttle: Duration,
    /// Retention after a close, for exit transitions.
    pub close_grace: Duration,
    /// Staleness window while the connection reports `READY`.
    pub health_timeout: Duration,
    /// Correlation window for one snapshot refresh request.
    pub refresh_timeout: Duration,
    /// Refresh attempts before a hard error is surfaced.
    pub max_refresh_attempts: u32,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            price_throttle: Duration::from_millis(1000),
            pnl_throttle: Duration::from_millis(500),
            bulk_throttle: Duration::from_millis(2000),
            close_grace: Duration::from_secs(5),
            health_timeout: Duration::from_secs(30),
            refresh_timeout: Duration::from_secs(10),
            max_refresh_attempts: 3,
        }
    }
}

/// Complete sync service configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Broker environment.
    pub environment: Environment,
    /// Gateway base URL (e.g. `ws://localhost:8001`).
    pub base_url: String,
    /// Path of the durable key-value store file.
    pub storage_path: String,
    /// WebSocket connection settings.
    pub websocket: WebSocketSettings,
    /// Outbound rate limits.
    pub rate_limits: RateLimitSettings,
    /// Cache TTLs and persistence cadence.
    pub cache: CacheSettings,
    /// Position reconciliation settings.
    pub reconciler: ReconcilerSettings,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Demo,
            base_url: "ws://localhost:8001".to_string(),
            storage_path: "broker-sync-state.json".to_string(),
            websocket: WebSocketSettings::default(),
            rate_limits: RateLimitSettings::default(),
            cache: CacheSettings::default(),
            reconciler: ReconcilerSettings::default(),
        }
    }
}

impl SyncConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `BROKER_SYNC_GATEWAY_URL` is set but empty.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let base_url = match std::env::var("BROKER_SYNC_GATEWAY_URL") {
            Ok(url) if url.is_empty() => {
                return Err(ConfigError::EmptyValue("BROKER_SYNC_GATEWAY_URL".to_string()));
            }
            Ok(url) => url,
            Err(_) => defaults.base_url,
        };

        let environment = std::env::var("BROKER_SYNC_ENV")
            .map(|s| Environment::from_str_case_insensitive(&s))
            .unwrap_or_default();

        let storage_path =
            std::env::var("BROKER_SYNC_STORAGE_PATH").unwrap_or(defaults.storage_path);

        let websocket = WebSocketSettings {
            heartbeat_interval: parse_env_duration_secs(
                "BROKER_SYNC_HEARTBEAT_INTERVAL_SECS",
                defaults.websocket.heartbeat_interval,
            ),
            heartbeat_timeout: parse_env_duration_secs(
                "BROKER_SYNC_HEARTBEAT_TIMEOUT_SECS",
                defaults.websocket.heartbeat_timeout,
            ),
            reconnect_delay_initial: parse_env_duration_millis(
                "BROKER_SYNC_RECONNECT_DELAY_INITIAL_MS",
                defaults.websocket.reconnect_delay_initial,
            ),
            reconnect_delay_max: parse_env_duration_secs(
                "BROKER_SYNC_RECONNECT_DELAY_MAX_SECS",
                defaults.websocket.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: parse_env_f64(
                "BROKER_SYNC_RECONNECT_DELAY_MULTIPLIER",
                defaults.websocket.reconnect_delay_multiplier,
            ),
            max_reconnect_attempts: parse_env_u32(
                "BROKER_SYNC_MAX_RECONNECT_ATTEMPTS",
                defaults.websocket.max_reconnect_attempts,
            ),
            handshake_timeout: parse_env_duration_secs(
                "BROKER_SYNC_HANDSHAKE_TIMEOUT_SECS",
                defaults.websocket.handshake_timeout,
            ),
            outbound_capacity: parse_env_usize(
                "BROKER_SYNC_OUTBOUND_CAPACITY",
                defaults.websocket.outbound_capacity,
            ),
        };

        let rate_limits = RateLimitSettings {
            default_limit: parse_env_u32(
                "BROKER_SYNC_RATE_LIMIT_DEFAULT",
                defaults.rate_limits.default_limit,
            ),
            market_data_limit: parse_env_u32(
                "BROKER_SYNC_RATE_LIMIT_MARKET_DATA",
                defaults.rate_limits.market_data_limit,
            ),
            orders_limit: parse_env_u32(
                "BROKER_SYNC_RATE_LIMIT_ORDERS",
                defaults.rate_limits.orders_limit,
            ),
            interval: parse_env_duration_secs(
                "BROKER_SYNC_RATE_LIMIT_INTERVAL_SECS",
                defaults.rate_limits.interval,
            ),
            min_backoff: parse_env_duration_millis(
                "BROKER_SYNC_RATE_LIMIT_BACKOFF_MS",
                defaults.rate_limits.min_backoff,
            ),
        };

        let cache = CacheSettings {
            market_data_ttl: parse_env_duration_secs(
                "BROKER_SYNC_CACHE_MARKET_DATA_TTL_SECS",
                defaults.cache.market_data_ttl,
            ),
            positions_ttl: parse_env_duration_secs(
                "BROKER_SYNC_CACHE_POSITIONS_TTL_SECS",
                defaults.cache.positions_ttl,
            ),
            orders_ttl: parse_env_duration_secs(
                "BROKER_SYNC_CACHE_ORDERS_TTL_SECS",
                defaults.cache.orders_ttl,
            ),
            account_data_ttl: parse_env_duration_secs(
                "BROKER_SYNC_CACHE_ACCOUNT_TTL_SECS",
                defaults.cache.account_data_ttl,
            ),
            persist_interval: parse_env_duration_secs(
                "BROKER_SYNC_CACHE_PERSIST_INTERVAL_SECS",
                defaults.cache.persist_interval,
            ),
        };

        Ok(Self {
            environment,
            base_url,
            storage_path,
            websocket,
            rate_limits,
            cache,
            reconciler: defaults.reconciler,
        })
    }

    /// WebSocket URL for a (broker, account) pair.
    #[must_use]
    pub fn gateway_url(&self, broker_id: &str, account_id: &str, token: &str) -> String {
        format!(
            "{}/ws/{broker_id}?broker_account_id={account_id}&token={token}",
            self.base_url
        )
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
}

fn parse_env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
