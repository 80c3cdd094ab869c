use std::time::Duration;

use crate::config::Settings;

/// Stage-level retry policy for transient failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_retries: settings.max_stage_retries,
            base_delay: settings.retry_base_delay,
            ..Self::default()
        }
    }

    /// No waiting between attempts.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Exponential backoff before retry number `retry` (1-based).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn allows_retry(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }
}
