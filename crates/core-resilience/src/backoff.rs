//! Exponential backoff with jitter
//!
//! # Example
//!
//! ```
//! use fedbroker_core_resilience::{Backoff, BackoffConfig};
//! use std::time::Duration;
//!
//! let config = BackoffConfig {
//!     initial: Duration::from_millis(100),
//!     max: Duration::from_secs(1),
//!     multiplier: 2.0,
//!     jitter: 0.0,
//!     max_retries: Some(3),
//! };
//!
//! let mut backoff = Backoff::new(config);
//! assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
//! assert_eq!(backoff.next_delay(), Some(Duration::from_millis(200)));
//! assert_eq!(backoff.next_delay(), Some(Duration::from_millis(400)));
//! assert_eq!(backoff.next_delay(), None);
//! ```

use rand::Rng;
use std::time::Duration;

/// Configuration for backoff behavior
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial: Duration,
    /// Upper bound for any single delay, jitter included
    pub max: Duration,
    /// Growth factor applied after each delay
    pub multiplier: f64,
    /// Relative jitter in `[0.0, 1.0]`; 0.1 spreads delays by ±10%
    pub jitter: f64,
    /// Maximum number of retries, `None` to retry until cancelled
    pub max_retries: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
            max_retries: None,
        }
    }
}

impl BackoffConfig {
    /// Constant delay without jitter
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial: delay,
            max: delay,
            multiplier: 1.0,
            jitter: 0.0,
            max_retries: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Stateful delay generator for one retry sequence
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
    retries: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let current = config.initial;
        Self {
            config,
            current,
            retries: 0,
        }
    }

    /// Delay before the next retry, or `None` once the retry budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max_retries) = self.config.max_retries {
            if self.retries >= max_retries {
                return None;
            }
        }
        self.retries += 1;

        let base = self.current.min(self.config.max);
        self.current = Duration::from_secs_f64(
            (self.current.as_secs_f64() * self.config.multiplier.max(1.0))
                .min(self.config.max.as_secs_f64()),
        );

        Some(self.apply_jitter(base))
    }

    fn apply_jitter(&self, base: Duration) -> Duration {
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }

        let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
        base.mul_f64(factor).min(self.config.max)
    }

    /// Start over from the initial delay
    pub fn reset(&mut self) {
        self.current = self.config.initial;
        self.retries = 0;
    }

    /// Retries handed out since creation or the last reset
    pub fn retries(&self) -> u32 {
        self.retries
    }
}
