use std::time::Duration;

use rand::{Rng, rng};

use super::config::RetryConfig;
use crate::error::ScanError;

/// Exponential backoff with jitter for transient task failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        u32::from(self.config.max_attempts.max(1))
    }

    /// Whether a failure on attempt `attempt` (1-based) gets another try.
    pub fn should_retry(&self, error: &ScanError, attempt: u32) -> bool {
        error.is_retryable() && attempt < self.max_attempts()
    }

    fn base_delay_ms(&self, attempt: u32) -> u64 {
        if attempt == 0 {
            return 0;
        }
        let exp = attempt.saturating_sub(1).min(31) as i32;
        let scaled = (self.config.backoff_base_ms as f64) * 2f64.powi(exp);
        scaled.min(self.config.backoff_max_ms as f64).max(0.0) as u64
    }

    /// Delay before retrying after failed attempt `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let anchor = self.base_delay_ms(attempt);
        if anchor == 0 {
            return Duration::ZERO;
        }

        let jitter_ratio = f64::from(self.config.jitter_ratio.max(0.0));
        let span = ((anchor as f64) * jitter_ratio)
            .max(self.config.jitter_min_ms as f64)
            .min(self.config.backoff_max_ms as f64);
        let lower = (anchor as f64 - span).max(0.0);
        let upper = (anchor as f64 + span).min(self.config.backoff_max_ms as f64);
        if upper <= lower {
            return Duration::from_millis(lower.round() as u64);
        }
        Duration::from_millis(rng().random_range(lower..=upper).round() as u64)
    }
}
