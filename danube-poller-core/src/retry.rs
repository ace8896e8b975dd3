//! Retry policy with pure exponential backoff.

use std::time::Duration;

/// Retry configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of additional attempts after the first one
    pub max_retries: u32,
    /// Delay before the first retry; doubled for every following one
    pub base_delay: Duration,
}

impl RetryConfig {
    pub fn new(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(base_delay_ms),
        }
    }

    /// Disable retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3, 1000)
    }
}

/// Retry decisions and backoff computation.
#[derive(Debug, Clone, Copy)]
pub struct RetryStrategy {
    config: RetryConfig,
}

impl RetryStrategy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Whether another attempt is allowed after `attempt` retries have run.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.config.max_retries
    }

    /// Delay before retry `attempt` (0-indexed): `base_delay * 2^attempt`.
    ///
    /// No jitter. Saturates instead of overflowing for absurd attempt counts.
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let Some(factor) = 2u32.checked_pow(attempt) else {
            return Duration::MAX;
        };
        self.config
            .base_delay
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
