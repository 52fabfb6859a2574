//! Reconnect backoff as a pure value object, independent of timers.

use std::time::Duration;

/// Maps a retry-attempt count to the wait before the next reconnection
/// attempt: `min(base * 2^(attempt-1), max)`, bounded by `max_attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
    max_attempts: u32,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts,
        }
    }

    /// The delay before attempt `attempt` (1-based). `None` when the attempt
    /// budget is exhausted (or for the nonsensical attempt 0).
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let exponent = (attempt - 1).min(31);
        let factor = 2u32.saturating_pow(exponent);
        Some(self.base.saturating_mul(factor).min(self.max))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_until_capped() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 8);
        let delays: Vec<_> = (1..=8).map(|k| policy.delay(k).unwrap()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16),
                Duration::from_secs(30),
                Duration::from_secs(30),
                Duration::from_secs(30),
            ]
        );
    }

    #[test]
    fn attempt_budget_is_bounded() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 5);
        assert!(policy.delay(5).is_some());
        assert_eq!(policy.delay(6), None);
        assert_eq!(policy.delay(0), None);
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30), u32::MAX);
        assert_eq!(policy.delay(64), Some(Duration::from_secs(30)));
        assert_eq!(policy.delay(u32::MAX), Some(Duration::from_secs(30)));
    }
}
