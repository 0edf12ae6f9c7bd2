//! Backoff between attempts of the same work item.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff with an upper bound and optional jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryBackoff {
    /// Delay after the first failed attempt in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Multiplier applied per further failed attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Whether to add up to 25% jitter.
    #[serde(default = "default_true")]
    pub use_jitter: bool,
}

fn default_initial_delay_ms() -> u64 {
    2000
}

fn default_max_delay_ms() -> u64 {
    30000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

impl RetryBackoff {
    /// No delay at all between attempts.
    pub fn none() -> Self {
        Self {
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            use_jitter: false,
        }
    }

    fn base_delay_ms(&self, failed_attempt: u32) -> u64 {
        let exponent = failed_attempt.saturating_sub(1).min(31) as i32;
        let delay = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        delay.min(self.max_delay_ms as f64) as u64
    }

    /// Delay to wait after attempt `failed_attempt` (1-indexed) failed.
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let delay_ms = self.base_delay_ms(failed_attempt);
        if self.use_jitter && delay_ms > 0 {
            let jitter = (delay_ms as f64 * 0.25 * rand::random::<f64>()) as u64;
            Duration::from_millis(delay_ms + jitter)
        } else {
            Duration::from_millis(delay_ms)
        }
    }
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            use_jitter: default_true(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_and_caps() {
        let backoff = RetryBackoff {
            initial_delay_ms: 1000,
            max_delay_ms: 5000,
            multiplier: 2.0,
            use_jitter: false,
        };
        assert_eq!(backoff.delay_after(1), Duration::from_millis(1000));
        assert_eq!(backoff.delay_after(2), Duration::from_millis(2000));
        assert_eq!(backoff.delay_after(3), Duration::from_millis(4000));
        assert_eq!(backoff.delay_after(4), Duration::from_millis(5000));
        assert_eq!(backoff.delay_after(40), Duration::from_millis(5000));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let backoff = RetryBackoff {
            initial_delay_ms: 1000,
            ..Default::default()
        };
        for _ in 0..20 {
            let delay = backoff.delay_after(1);
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay <= Duration::from_millis(1250));
        }
    }

    #[test]
    fn test_none_never_waits() {
        let backoff = RetryBackoff::none();
        assert_eq!(backoff.delay_after(1), Duration::ZERO);
        assert_eq!(backoff.delay_after(5), Duration::ZERO);
    }
}
