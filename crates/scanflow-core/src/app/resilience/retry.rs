//! Retry policy: decides backoff delays.

use rand::Rng;
use std::time::Duration;

/// Backoff policy shared by stage retries, persistence retries and the RPC client.
///
/// delay(attempt) = min(base_delay * multiplier^attempt, max_delay) * jitter
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Base delay for the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Cap applied before jitter.
    pub max_delay: Duration,

    /// Symmetric jitter fraction. 0.25 means a factor in [0.75, 1.25].
    pub jitter: f64,
}

impl RetryPolicy {
    /// Same delay every time.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
            jitter: 0.0,
        }
    }

    /// Doubling backoff with ±25% jitter.
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            multiplier: 2.0,
            max_delay,
            jitter: 0.25,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Capped delay before jitter.
    ///
    /// # Arguments
    /// * `attempt` - Retries already made (0 for the first retry).
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    /// Delay before retry number `attempt + 1`, with jitter.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let delay = self.capped_delay(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        delay.mul_f64(factor.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_until_capped() {
        let policy =
            RetryPolicy::exponential(Duration::from_millis(100), Duration::from_secs(2)).without_jitter();

        assert_eq!(policy.next_delay(0), Duration::from_millis(100));
        assert_eq!(policy.next_delay(1), Duration::from_millis(200));
        assert_eq!(policy.next_delay(3), Duration::from_millis(800));
        assert_eq!(policy.next_delay(5), Duration::from_secs(2));
        assert_eq!(policy.next_delay(200), Duration::from_secs(2));
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let policy = RetryPolicy::exponential(Duration::from_millis(100), Duration::from_secs(2));
        for attempt in 0..6 {
            let base = policy.capped_delay(attempt).as_secs_f64();
            for _ in 0..50 {
                let d = policy.next_delay(attempt).as_secs_f64();
                assert!(d >= base * 0.75 - 1e-9, "{d} < {base}*0.75");
                assert!(d <= base * 1.25 + 1e-9, "{d} > {base}*1.25");
            }
        }
    }

    #[test]
    fn fixed_policy_never_changes() {
        let policy = RetryPolicy::fixed(Duration::from_secs(2));
        assert_eq!(policy.next_delay(0), Duration::from_secs(2));
        assert_eq!(policy.next_delay(7), Duration::from_secs(2));
    }
}
