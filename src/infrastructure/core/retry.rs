//! One retry policy for every boundary: HTTP clients, oracle calls and the
//! order-submit loop all share the same backoff shape and the same notion of
//! "retryable".

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self { max_attempts, base_delay, max_delay }
    }

    /// Exponential backoff, capped: base * 2^attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Transient faults are retried; auth errors and other 4xx are not.
    pub fn is_retryable(error: &str) -> bool {
        let lower = error.to_lowercase();
        ["timeout", "timed out", "rate limit", "429", "500", "502", "503", "504", "network", "connection"]
            .iter()
            .any(|marker| lower.contains(marker))
    }
}
