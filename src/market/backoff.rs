use rand::Rng;
use std::time::Duration;

/// Exponential backoff schedule shared by the socket reconnect loop and the
/// REST retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub jitter: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based), jitter included.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        with_jitter(backoff_delay(attempt, self.base, self.cap), self.jitter)
    }

    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }
}

/// `min(base * 2^attempt, cap)`, saturating.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let multiplier = 1_u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
    base.saturating_mul(multiplier).min(cap)
}

pub fn with_jitter(delay: Duration, jitter_max: Duration) -> Duration {
    let jitter_max_ms = jitter_max.as_millis().min(u64::MAX as u128) as u64;
    if jitter_max_ms == 0 {
        return delay;
    }
    let jitter_ms = rand::thread_rng().gen_range(0..=jitter_max_ms);
    delay.saturating_add(Duration::from_millis(jitter_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_cap() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_millis(1_000);

        assert_eq!(backoff_delay(0, base, cap), Duration::from_millis(100));
        assert_eq!(backoff_delay(1, base, cap), Duration::from_millis(200));
        assert_eq!(backoff_delay(3, base, cap), Duration::from_millis(800));
        assert_eq!(backoff_delay(4, base, cap), cap);
        assert_eq!(backoff_delay(u32::MAX, base, cap), cap);
    }

    #[test]
    fn delay_is_bounded_and_non_decreasing() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(250),
            cap: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
            max_attempts: 8,
        };

        let mut previous = Duration::ZERO;
        for attempt in 0..64 {
            let raw = backoff_delay(attempt, policy.base, policy.cap);
            assert!(raw >= previous);
            previous = raw;

            let jittered = policy.delay_for(attempt);
            assert!(jittered >= raw);
            assert!(jittered <= policy.cap + policy.jitter);
        }
    }

    #[test]
    fn zero_jitter_is_exact() {
        let delay = with_jitter(Duration::from_millis(42), Duration::ZERO);
        assert_eq!(delay, Duration::from_millis(42));
    }

    #[test]
    fn exhaustion_is_strictly_after_max_attempts() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(1),
            jitter: Duration::ZERO,
            max_attempts: 3,
        };

        assert!(!policy.is_exhausted(3));
        assert!(policy.is_exhausted(4));
    }
}
