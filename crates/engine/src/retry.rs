use meridian_core::Timestamp;
use meridian_core::config::RetryConfig;

/// Deterministic exponential backoff for transient intake failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base_delay_ms: u64,
    max_delay_ms: u64,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
            max_attempts: config.max_attempts,
        }
    }

    /// Delay after the `attempt`-th failure (1-based): base * 2^(attempt-1), capped.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1).min(63);
        self.base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms)
    }

    pub fn retry_at(&self, now: Timestamp, attempt: u32) -> Timestamp {
        now.saturating_add_ms(self.delay_ms(attempt))
    }

    /// A record that has used up its attempts is parked instead of retried.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_until_cap() {
        let backoff = Backoff::new(&RetryConfig {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            conflict_retries: 8,
        });
        let delays: Vec<u64> = (1..=6).map(|a| backoff.delay_ms(a)).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
        assert_eq!(backoff.delay_ms(200), 1_000);
        assert_eq!(
            backoff.retry_at(Timestamp::from_millis(50), 2),
            Timestamp::from_millis(250)
        );
    }

    #[test]
    fn parks_after_max_attempts() {
        let backoff = Backoff::new(&RetryConfig::default());
        assert!(!backoff.exhausted(4));
        assert!(backoff.exhausted(5));
    }
}
