//! Retry utilities with exponential backoff, cap, and jitter.
//!
//! Drives the saga step retry loop, where each attempt must write its own
//! write-ahead event and therefore cannot be wrapped in a generic retry
//! combinator.

use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Base delay for the first retry (before jitter).
    pub base_delay: Duration,
    /// Maximum delay cap (before jitter).
    pub max_delay: Duration,
    /// Maximum number of retry attempts (0 = no retries, just the initial attempt).
    pub max_retries: u32,
    /// Backoff multiplier applied per attempt.
    pub multiplier: f64,
    /// Jitter factor: delay is multiplied by a value in [1-jitter, 1+jitter].
    /// Set to 0.0 for no jitter.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            max_retries: 3,
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl RetryConfig {
    /// Calculate the delay for a given attempt number (0-indexed).
    ///
    /// delay = base * multiplier^attempt, capped at max_delay. Jitter uses a
    /// cheap time-based hash to avoid thundering herds without threading an
    /// RNG through the orchestrator.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let factor = self.multiplier.max(1.0).powi(attempt.min(20) as i32);
        let capped_ms = (base_ms * factor).min(self.max_delay.as_millis() as f64);

        let jittered_ms = if self.jitter > 0.0 {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0) as u64;
            let hash = now.wrapping_mul(31).wrapping_add(attempt as u64 * 17);
            let jitter_pct = ((hash % 1000) as f64 / 1000.0) * 2.0 - 1.0;
            capped_ms * (1.0 + jitter_pct * self.jitter)
        } else {
            capped_ms
        };

        Duration::from_millis(jittered_ms.max(0.0) as u64)
    }

    /// Check if another retry attempt should be made.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}
