use std::time;

/// The retry policy the writer uses to space out attempts at a failed batch
/// insert. The writer owns the retry loop itself so that it can interrupt
/// the backoff sleep on shutdown; this type only answers "how many attempts"
/// and "how long until the next one".
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: time::Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: time::Duration) -> Self {
        Self {
            // A policy of zero attempts would make every submission fail
            // without touching the database.
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait after the given 1-based attempt: `base_delay * 2^(k-1)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> time::Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay * 2u32.saturating_pow(exponent)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: time::Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_per_attempt() {
        let policy = RetryPolicy::new(5, time::Duration::from_secs(1));

        assert_eq!(policy.delay_for_attempt(1), time::Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), time::Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), time::Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(4), time::Duration::from_secs(8));
    }

    #[test]
    fn test_zero_attempts_is_clamped_to_one() {
        let policy = RetryPolicy::new(0, time::Duration::from_millis(100));
        assert_eq!(policy.max_attempts(), 1);
    }
}
