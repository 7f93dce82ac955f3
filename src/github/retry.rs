//! Exponential backoff schedules.
//!
//! CI API calls are never retried in line; a failed event waits for the
//! reconciler. Backoff is used where waiting is safe: re-subscribing to the
//! access-request watch stream.

use std::time::Duration;

/// Configuration for exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt).
    pub max_retries: u32,

    pub initial_delay: Duration,

    /// Cap for exponential growth.
    pub max_delay: Duration,

    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Schedule for re-establishing a dropped watch stream: 1s base, 30s cap.
    ///
    /// `max_retries` is unused by the watch adapter, which retries until
    /// shutdown.
    pub const RESUBSCRIBE: Self = Self {
        max_retries: u32::MAX,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(30),
        backoff_multiplier: 2.0,
    };

    pub fn new(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            backoff_multiplier,
        }
    }

    /// Delay before retry `attempt` (0-indexed):
    /// `initial_delay * backoff_multiplier^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay_secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }

    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_retries).map(|attempt| self.delay_for_attempt(attempt))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::RESUBSCRIBE
    }
}
