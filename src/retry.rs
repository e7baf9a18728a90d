//! Retry policy for outgoing activity delivery
//!
//! Delivery of an outbound activity to a single inbox is retried with
//! exponential backoff and jitter until it succeeds, the attempt limit is
//! reached, or the recipient inbox is marked permanently unreachable by the
//! host application's queue.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff schedule with jitter, used by the outbox worker
/// between delivery attempts to the same inbox.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Maximum number of delivery attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on the computed delay, before jitter is applied.
    pub max_delay: Duration,
    /// Fraction of the computed delay added as random jitter, in `[0, 1]`.
    /// The effective multiplier applied to the backoff delay never exceeds
    /// `1 + jitter_factor`.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60 * 60 * 12),
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Compute the delay before attempt number `attempt` (1-indexed; the
    /// delay before the *second* attempt is `delay_for(2)`). Returns `None`
    /// once `attempt` exceeds `max_attempts`.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt < 2 || attempt > self.max_attempts {
            return None;
        }
        let exponent = attempt - 2;
        let base = self.base_delay.as_secs_f64();
        let uncapped = base * 2f64.powi(exponent as i32);
        let capped = uncapped.min(self.max_delay.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.0..=self.jitter_factor);
        Some(Duration::from_secs_f64(capped * (1.0 + jitter)))
    }

    /// True if another attempt should be made after `attempt` has failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_with_attempt() {
        let policy = RetryPolicy {
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        };
        let d2 = policy.delay_for(2).unwrap();
        let d3 = policy.delay_for(3).unwrap();
        assert!(d3 > d2);
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 50,
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        };
        let delay = policy.delay_for(40).unwrap();
        assert!(delay <= policy.max_delay);
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        let policy = RetryPolicy {
            jitter_factor: 0.25,
            ..RetryPolicy::default()
        };
        for attempt in 2..policy.max_attempts {
            let delay = policy.delay_for(attempt).unwrap();
            let uncapped = policy.base_delay.as_secs_f64() * 2f64.powi((attempt - 2) as i32);
            let capped = uncapped.min(policy.max_delay.as_secs_f64());
            assert!(delay.as_secs_f64() <= capped * 1.25 + f64::EPSILON);
        }
    }

    #[test]
    fn exceeding_max_attempts_returns_none() {
        let policy = RetryPolicy::default();
        assert!(policy.delay_for(policy.max_attempts + 1).is_none());
    }

    #[test]
    fn should_retry_stops_at_limit() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(policy.max_attempts - 1));
        assert!(!policy.should_retry(policy.max_attempts));
    }
}
