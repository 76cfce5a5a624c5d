//! Outbound Rate Limiting
//!
//! Every send passes through a per-category rolling-window limiter.
//! Backpressure is not failure: a caller over the limit is parked until
//! the window resets and then proceeds. Nothing is ever dropped.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

// =============================================================================
// Categories
// =============================================================================

/// Rate limit category for outbound messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RateCategory {
    /// General control traffic.
    #[default]
    Default,
    /// Market data subscribe/unsubscribe traffic.
    MarketData,
    /// Order placement and cancellation.
    Orders,
}

impl RateCategory {
    /// All categories.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Default, Self::MarketData, Self::Orders]
    }

    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::MarketData => "market_data",
            Self::Orders => "orders",
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Limits for one category.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Messages allowed per window.
    pub limit: u32,
    /// Window length.
    pub interval: Duration,
    /// Minimum wait once the limit is hit.
    pub min_backoff: Duration,
}

impl RateLimitConfig {
    /// Create a new configuration.
    #[must_use]
    pub const fn new(limit: u32, interval: Duration, min_backoff: Duration) -> Self {
        Self {
            limit,
            interval,
            min_backoff,
        }
    }

    /// Default limits for a category.
    #[must_use]
    pub const fn for_category(category: RateCategory) -> Self {
        let limit = match category {
            RateCategory::Default => 100,
            RateCategory::MarketData => 200,
            RateCategory::Orders => 30,
        };
        Self::new(limit, Duration::from_secs(60), Duration::from_millis(500))
    }
}

// =============================================================================
// Limiter
// =============================================================================

#[derive(Debug)]
struct WindowState {
    count: u32,
    window_start: Instant,
}

/// Rolling-window rate limiter for one category.
///
/// `acquire()` returns immediately while the window has room; once the
/// limit is hit it parks the caller until the window resets.
#[derive(Debug)]
pub struct RateLimiter {
    category: RateCategory,
    config: RateLimitConfig,
    state: Mutex<WindowState>,
}

impl RateLimiter {
    /// Create a limiter with explicit configuration.
    #[must_use]
    pub fn new(category: RateCategory, config: RateLimitConfig) -> Self {
        Self {
            category,
            config,
            state: Mutex::new(WindowState {
                count: 0,
                window_start: Instant::now(),
            }),
        }
    }

    /// Create a limiter with the category's default limits.
    #[must_use]
    pub fn with_defaults(category: RateCategory) -> Self {
        Self::new(category, RateLimitConfig::for_category(category))
    }

    /// Acquire one send slot, waiting out the window if necessary.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();

                if now.duration_since(state.window_start) >= self.config.interval {
                    state.count = 0;
                    state.window_start = now;
                }

                if state.count < self.config.limit {
                    state.count += 1;
                    return;
                }

                let until_reset = (state.window_start + self.config.interval)
                    .saturating_duration_since(now);
                until_reset.max(self.config.min_backoff)
            };

            tracing::warn!(
                category = self.category.as_str(),
                wait_ms = wait.as_millis(),
                "rate limit hit, delaying send"
            );
            metrics::counter!("broker_sync_rate_limit_waits_total").increment(1);
            tokio::time::sleep(wait).await;
        }
    }

    /// Sends consumed in the current window.
    pub async fn current_count(&self) -> u32 {
        self.state.lock().await.count
    }
}

/// The full set of per-category limiters used by the manager.
#[derive(Debug)]
pub struct RateLimiterSet {
    default: RateLimiter,
    market_data: RateLimiter,
    orders: RateLimiter,
}

impl Default for RateLimiterSet {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl RateLimiterSet {
    /// Create limiters with default per-category limits.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self {
            default: RateLimiter::with_defaults(RateCategory::Default),
            market_data: RateLimiter::with_defaults(RateCategory::MarketData),
            orders: RateLimiter::with_defaults(RateCategory::Orders),
        }
    }

    /// Create limiters from explicit per-category configuration.
    #[must_use]
    pub fn new(
        default: RateLimitConfig,
        market_data: RateLimitConfig,
        orders: RateLimitConfig,
    ) -> Self {
        Self {
            default: RateLimiter::new(RateCategory::Default, default),
            market_data: RateLimiter::new(RateCategory::MarketData, market_data),
            orders: RateLimiter::new(RateCategory::Orders, orders),
        }
    }

    /// The limiter for a category.
    #[must_use]
    pub const fn limiter(&self, category: RateCategory) -> &RateLimiter {
        match category {
            RateCategory::Default => &self.default,
            RateCategory::MarketData => &self.market_data,
            RateCategory::Orders => &self.orders,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
