//! Reconnection Policy
//!
//! Exponential backoff with jitter for gateway reconnection. The policy
//! is consulted after every dropped connection; a successful handshake
//! resets it.

use std::time::Duration;

use rand::Rng;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Cap on the delay between attempts.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each attempt.
    pub multiplier: f64,
    /// Jitter fraction (0.1 = ±10% randomization).
    pub jitter_factor: f64,
    /// Attempt cap (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 5,
        }
    }
}

/// Exponential backoff policy with jitter and an attempt cap.
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current_delay: Duration,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a new policy from configuration.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        let initial_delay = config.initial_delay;
        Self {
            config,
            current_delay: initial_delay,
            attempt_count: 0,
        }
    }

    /// Delay before the next attempt, or `None` once the cap is reached.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.config.max_attempts > 0 && self.attempt_count >= self.config.max_attempts {
            return None;
        }

        self.attempt_count += 1;

        let delay_with_jitter = self.apply_jitter(self.current_delay);

        #[allow(clippy::cast_precision_loss)]
        let scaled = (self.current_delay.as_millis() as f64 * self.config.multiplier).round();
        let next_millis = if scaled.is_finite() && scaled > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                scaled as u128
            }
        } else {
            0
        };
        let capped = next_millis.min(self.config.max_delay.as_millis());
        self.current_delay = Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX));

        Some(delay_with_jitter)
    }

    /// Reset after a successful handshake.
    pub const fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.attempt_count = 0;
    }

    /// Attempts consumed so far in this outage.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Whether another attempt is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let mut rng = rand::rng();
        let jitter: f64 = rng.random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted_u64 = adjusted_millis as u64;
        Duration::from_millis(adjusted_u64)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn no_jitter(initial_ms: u64, max_ms: u64, max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy::new(ReconnectConfig {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts,
        })
    }

    #[test]
    fn default_config_values() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(2));
        assert_eq!(config.max_delay, Duration::from_secs(60));
        assert_eq!(config.max_attempts, 5);
    }

    #[test]
    fn delays_double_each_attempt() {
        let mut policy = no_jitter(100, 10_000, 0);
        assert_eq!(policy.next_delay().unwrap(), Duration::from_millis(100));
        assert_eq!(policy.next_delay().unwrap(), Duration::from_millis(200));
        assert_eq!(policy.next_delay().unwrap(), Duration::from_millis(400));
        assert_eq!(policy.next_delay().unwrap(), Duration::from_millis(800));
    }

    #[test]
    fn delay_is_capped() {
        let mut policy = no_jitter(1000, 2000, 0);
        let _ = policy.next_delay();
        assert_eq!(policy.next_delay().unwrap(), Duration::from_millis(2000));
        assert_eq!(policy.next_delay().unwrap(), Duration::from_millis(2000));
    }

    #[test]
    fn attempt_cap_is_enforced() {
        let mut policy = no_jitter(100, 1000, 3);
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_none());
        assert!(!policy.should_retry());
        assert_eq!(policy.attempt_count(), 3);
    }

    #[test]
    fn reset_restores_initial_state() {
        let mut policy = no_jitter(100, 10_000, 3);
        let _ = policy.next_delay();
        let _ = policy.next_delay();

        policy.reset();

        assert_eq!(policy.attempt_count(), 0);
        assert!(policy.should_retry());
        assert_eq!(policy.next_delay().unwrap(), Duration::from_millis(100));
    }

    #[test]
    fn zero_max_attempts_means_unlimited() {
        let mut policy = no_jitter(1, 10, 0);
        for _ in 0..500 {
            assert!(policy.next_delay().is_some());
        }
        assert!(policy.should_retry());
    }

    proptest! {
        #[test]
        fn jitter_stays_within_bounds(base_ms in 100u64..10_000) {
            let mut policy = ReconnectPolicy::new(ReconnectConfig {
                initial_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_secs(3600),
                multiplier: 2.0,
                jitter_factor: 0.1,
                max_attempts: 0,
            });

            let delay = policy.next_delay().unwrap().as_millis() as u64;
            let lo = base_ms - base_ms / 10 - 1;
            let hi = base_ms + base_ms / 10 + 1;
            prop_assert!(delay >= lo, "delay {delay}ms below {lo}ms");
            prop_assert!(delay <= hi, "delay {delay}ms above {hi}ms");
        }

        #[test]
        fn delays_never_exceed_cap_plus_jitter(
            initial_ms in 1u64..5_000,
            attempts in 1usize..20,
        ) {
            let max_ms = 2_000u64;
            let mut policy = ReconnectPolicy::new(ReconnectConfig {
                initial_delay: Duration::from_millis(initial_ms),
                max_delay: Duration::from_millis(max_ms),
                multiplier: 2.0,
                jitter_factor: 0.1,
                max_attempts: 0,
            });

            for _ in 0..attempts {
                let delay = policy.next_delay().unwrap().as_millis() as u64;
                let bound = initial_ms.max(max_ms);
                prop_assert!(delay <= bound + bound / 10 + 1);
            }
        }
    }
}
