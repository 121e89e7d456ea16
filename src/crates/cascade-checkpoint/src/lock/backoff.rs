//! Backoff between lock acquisition attempts
//!
//! Delays grow linearly from `base` by `step` per failed attempt and stop
//! growing at `max`. With the defaults the sequence is
//! 100ms, 150ms, 200ms, ..., 500ms, 500ms, ...

use std::time::Duration;

/// Capped linear backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt
    pub base: Duration,
    /// Added for every further failed attempt
    pub step: Duration,
    /// Upper bound on any single delay
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, step: Duration, max: Duration) -> Self {
        Self { base, step, max }
    }

    /// Delay to wait after failed attempt number `attempt` (0-indexed)
    pub fn delay(&self, attempt: u32) -> Duration {
        let grown = self
            .step
            .checked_mul(attempt)
            .and_then(|extra| self.base.checked_add(extra))
            .unwrap_or(Duration::MAX);
        grown.min(self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            step: Duration::from_millis(50),
            max: Duration::from_millis(500),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_sequence() {
        let policy = BackoffPolicy::default();
        let delays: Vec<u128> = (0..11).map(|a| policy.delay(a).as_millis()).collect();
        assert_eq!(
            delays,
            vec![100, 150, 200, 250, 300, 350, 400, 450, 500, 500, 500]
        );
    }

    #[test]
    fn test_huge_attempt_saturates_at_cap() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn test_base_above_cap_is_capped() {
        let policy = BackoffPolicy::new(
            Duration::from_secs(2),
            Duration::from_millis(10),
            Duration::from_secs(1),
        );
        assert_eq!(policy.delay(0), Duration::from_secs(1));
    }

    proptest! {
        #[test]
        fn prop_delay_monotonic_and_capped(
            base in 0u64..1_000,
            step in 0u64..1_000,
            max in 0u64..5_000,
            attempt in 0u32..10_000,
        ) {
            let policy = BackoffPolicy::new(
                Duration::from_millis(base),
                Duration::from_millis(step),
                Duration::from_millis(max),
            );
            let current = policy.delay(attempt);
            let next = policy.delay(attempt + 1);
            prop_assert!(current <= next);
            prop_assert!(next <= policy.max);
        }
    }
}
