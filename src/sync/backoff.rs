//! Exponential backoff with jitter for sync retries.

use std::time::Duration;

use rand_distr::{Distribution, Open01};
use serde::{Deserialize, Serialize};

/// Fraction of the base delay added at most as random jitter.
const JITTER_FRACTION: f64 = 0.2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Attempts per round for transient failures before backing off.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    1_000
}
fn default_max_backoff_ms() -> u64 {
    300_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay before attempt `attempt + 1` (1-based `attempt`).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
        let base = self
            .initial_backoff_ms
            .saturating_mul(exponent)
            .min(self.max_backoff_ms);
        Duration::from_millis(base)
    }

    /// Base delay plus up to 20% jitter, never above the cap.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_millis() as u64;
        let unit: f64 = Open01.sample(&mut rand::rng());
        let jitter = (base as f64 * JITTER_FRACTION * unit) as u64;
        Duration::from_millis(base.saturating_add(jitter).min(self.max_backoff_ms))
    }
}

/// Backoff state across failed rounds. Grows with each failure and resets
/// after a fully successful round.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, failures: 0 }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a failure and return the delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.policy.delay(self.failures)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
        }
    }

    #[test]
    fn test_base_delay_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.base_delay(1), Duration::from_millis(100));
        assert_eq!(p.base_delay(2), Duration::from_millis(200));
        assert_eq!(p.base_delay(4), Duration::from_millis(800));
        assert_eq!(p.base_delay(5), Duration::from_millis(1_000));
        assert_eq!(p.base_delay(64), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let p = policy();
        for attempt in 1..8 {
            for _ in 0..50 {
                let d = p.delay(attempt);
                assert!(d >= p.base_delay(attempt));
                assert!(d <= Duration::from_millis(p.max_backoff_ms));
                assert!(d.as_millis() as f64 <= p.base_delay(attempt).as_millis() as f64 * 1.2 + 1.0);
            }
        }
    }

    #[test]
    fn test_backoff_grows_and_resets() {
        let mut backoff = Backoff::new(policy());
        let first = backoff.next_delay();
        let second = backoff.next_delay();
        let third = backoff.next_delay();
        assert!(first < Duration::from_millis(130));
        assert!(second >= Duration::from_millis(200));
        assert!(third >= Duration::from_millis(400));
        assert_eq!(backoff.failures(), 3);

        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert!(backoff.next_delay() < Duration::from_millis(130));
    }
}
