//! Retry policy with exponential backoff
//!
//! The executor retries connection opens and batch writes that fail with a
//! retryable [`ConnectorError`](crate::error::ConnectorError). Commits are
//! never retried.

use std::time::Duration;

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt)
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (2.0 doubles the delay each retry)
    pub backoff_multiplier: f64,
    /// Jitter factor (0.0 to 1.0) applied around the computed delay
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail on the first error
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Fixed delay between attempts, no backoff
    pub fn fixed_delay(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (1-based; 0 means no delay)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        // cap the exponent so powi cannot overflow
        let exponent = attempt.min(30) as i32 - 1;
        let base = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_millis() as f64);

        // deterministic jitter from the golden ratio sequence
        let jitter = if self.jitter_factor > 0.0 {
            let fraction = (attempt as f64 * 0.618_033_988_749_895) % 1.0;
            capped * self.jitter_factor * (fraction - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

/// Tracks failed attempts of one operation and hands out backoff delays
#[derive(Debug)]
pub struct RetryGuard {
    config: RetryConfig,
    failures: u32,
}

impl RetryGuard {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Record a failed attempt. Returns the delay before the next attempt, or
    /// `None` once the retry budget is exhausted.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures <= self.config.max_retries {
            Some(self.config.delay_for_attempt(self.failures))
        } else {
            None
        }
    }

    /// Attempts made so far, including the one that just failed
    pub fn attempts(&self) -> u32 {
        self.failures.max(1)
    }

    /// Retries granted so far
    pub fn retries(&self) -> u32 {
        self.failures.min(self.config.max_retries)
    }
}
