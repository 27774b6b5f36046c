use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const HARD_CAP_RETRY_ATTEMPTS: u32 = (20 * 60) / 5; // 20 mins / 5 sec interval
const DEFAULT_RETRY_INTERVAL_MS: u64 = 5000; // 5 seconds fixed interval
const DEFAULT_RETRY_JITTER_MS: u64 = 250;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Establishment retry policy for live subscriptions.
    pub retry: RetryPolicy,
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the establishment retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Bounded retry for subscription establishment.
///
/// Disabled by default (`max_attempts == 0`): an establishment failure is
/// reported to the caller and the next reconciliation pass retries the key.
/// A hard cap of 240 attempts (20 minutes / 5 seconds) is enforced
/// internally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Extra establishment attempts after the first failure. 0 disables retry.
    pub max_attempts: u32,
    /// Fixed delay between attempts, in milliseconds.
    pub interval_ms: u64,
    /// Random jitter added on top of the fixed delay, in milliseconds.
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            jitter_ms: DEFAULT_RETRY_JITTER_MS,
        }
    }
}

impl RetryPolicy {
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Sets the maximum number of retry attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the fixed delay between attempts.
    pub fn with_interval_ms(mut self, interval_ms: u64) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    /// Sets the random jitter added to each delay.
    pub fn with_jitter_ms(mut self, jitter_ms: u64) -> Self {
        self.jitter_ms = jitter_ms;
        self
    }

    pub fn effective_attempts(&self) -> u32 {
        self.max_attempts.min(HARD_CAP_RETRY_ATTEMPTS)
    }

    pub fn delay(&self) -> Duration {
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(self.interval_ms + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_defaults_to_disabled() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.effective_attempts(), 0);
    }

    #[test]
    fn attempts_are_hard_capped() {
        let policy = RetryPolicy::default().with_max_attempts(u32::MAX);
        assert_eq!(policy.effective_attempts(), HARD_CAP_RETRY_ATTEMPTS);
    }

    #[test]
    fn delay_stays_within_jitter_window() {
        let policy = RetryPolicy::default()
            .with_interval_ms(100)
            .with_jitter_ms(50);
        for _ in 0..32 {
            let delay = policy.delay().as_millis() as u64;
            assert!((100..=150).contains(&delay));
        }
    }
}
