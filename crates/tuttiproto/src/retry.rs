//! Reconnect and resend policy with capped exponential backoff.
//!
//! Devices use this to pace reconnection after a dropped stream; the
//! controller uses the same shape to re-send a start or stop whose ack
//! never arrived. Every policy has a finite attempt count.

use std::time::Duration;

/// Retry pacing.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts before giving up
    pub max_attempts: u32,
    /// Delay before the first retry
    pub backoff_base: Duration,
    /// Upper bound on any single delay
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    /// Delay to wait before attempt number `attempt` (1-based).
    ///
    /// attempt 0: zero
    /// attempt 1: backoff_base
    /// attempt n: min(backoff_base * 2^(n-1), backoff_max)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.backoff_base.saturating_mul(multiplier);
        std::cmp::min(delay, self.backoff_max)
    }

    /// Whether another attempt is allowed after `attempts_made` failures.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let policy = RetryPolicy::default()
            .with_backoff(Duration::from_millis(100), Duration::from_millis(1000));

        assert_eq!(policy.backoff_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for_attempt(4), Duration::from_millis(800));
        assert_eq!(policy.backoff_for_attempt(5), Duration::from_millis(1000));
        assert_eq!(policy.backoff_for_attempt(60), Duration::from_millis(1000));
    }

    #[test]
    fn bounded_attempts() {
        let policy = RetryPolicy::default().with_max_attempts(3);
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn default_gives_up_eventually() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 10);
        assert!(policy.should_retry(9));
        assert!(!policy.should_retry(10));
        assert!(!RetryPolicy::default().with_max_attempts(0).should_retry(0));
    }
}
