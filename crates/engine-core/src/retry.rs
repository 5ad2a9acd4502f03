use std::time::Duration;

/// Exponential backoff shaping for the bounded retry branches of the bulk
/// executor.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: if max_delay.is_zero() {
                base_delay
            } else {
                max_delay
            },
        }
    }

    /// Server-side bulk-infrastructure races and deadlocks: 0.5 s / 1 s / 2 s.
    pub fn bulk_infrastructure() -> Self {
        Self::new(3, Duration::from_millis(500), Duration::from_secs(2))
    }

    /// Pool exhaustion: unbounded attempts, delay capped at 32 s.
    /// `max_attempts` only shapes the exponent here; callers loop until
    /// cancellation.
    pub fn pool_exhaustion() -> Self {
        Self::new(usize::MAX, Duration::from_secs(1), Duration::from_secs(32))
    }

    /// Bounded retries for auth-token and connection failures.
    pub fn connection() -> Self {
        Self::new(3, Duration::from_millis(500), Duration::from_secs(5))
    }

    pub fn is_exhausted(&self, attempt: usize) -> bool {
        attempt >= self.max_attempts
    }

    /// Delay before retry number `attempt` (zero-based): base × 2^attempt,
    /// capped.
    pub fn backoff_delay(&self, attempt: usize) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = attempt.min(16) as u32;
        let factor = 1u128 << exponent;
        let delay_ms = self.base_delay.as_millis().saturating_mul(factor);
        let capped = delay_ms.min(self.max_delay.as_millis());
        Duration::from_millis(capped as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_infrastructure_backoff_sequence() {
        let policy = RetryPolicy::bulk_infrastructure();
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(500));
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(2));
        assert!(policy.is_exhausted(3));
    }

    #[test]
    fn pool_exhaustion_backoff_caps_at_32s() {
        let policy = RetryPolicy::pool_exhaustion();
        assert_eq!(policy.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(5), Duration::from_secs(32));
        assert_eq!(policy.backoff_delay(60), Duration::from_secs(32));
        assert!(!policy.is_exhausted(1_000_000));
    }
}
