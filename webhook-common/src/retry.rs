//! Exponential back-off policy shared by the monitor and delivery queues.
//! Accepts an optional upstream-preferred interval (a `Retry-After`
//! header, in the delivery worker's case) that overrides the computed
//! back-off when present.

use std::time::Duration;

#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    /// Coefficient to multiply `initial_interval` by for every past attempt.
    backoff_coefficient: u32,
    /// The back-off interval for the first retry.
    initial_interval: Duration,
    /// The maximum possible back-off between retries.
    maximum_interval: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: Duration,
        maximum_interval: Option<Duration>,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    /// Time to wait before the next retry, given how many attempts have
    /// already been made (0-indexed) and an optional upstream-preferred
    /// interval that should be honored but never exceed `maximum_interval`.
    pub fn time_until_next_retry(
        &self,
        attempt: u32,
        preferred_interval: Option<Duration>,
    ) -> Duration {
        let candidate = self
            .initial_interval
            .saturating_mul(self.backoff_coefficient.saturating_pow(attempt));

        match (preferred_interval, self.maximum_interval) {
            (Some(preferred), Some(max)) => std::cmp::min(std::cmp::max(candidate.min(max), preferred), max),
            (Some(preferred), None) => std::cmp::max(candidate, preferred),
            (None, Some(max)) => std::cmp::min(candidate, max),
            (None, None) => candidate,
        }
    }
}

impl Default for RetryPolicy {
    /// Matches spec.md 4.3's default: exponential, base 60s.
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: Duration::from_secs(60),
            maximum_interval: None,
        }
    }
}

/// Fixed (non-exponential) back-off used by the cleanup queue (spec.md 4.3).
pub fn fixed_interval(interval: Duration) -> RetryPolicy {
    RetryPolicy {
        backoff_coefficient: 1,
        initial_interval: interval,
        maximum_interval: Some(interval),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_with_each_attempt() {
        let policy = RetryPolicy::new(2, Duration::from_secs(60), None);
        assert_eq!(policy.time_until_next_retry(0, None), Duration::from_secs(60));
        assert_eq!(policy.time_until_next_retry(1, None), Duration::from_secs(120));
        assert_eq!(policy.time_until_next_retry(2, None), Duration::from_secs(240));
    }

    #[test]
    fn caps_at_maximum_interval() {
        let policy = RetryPolicy::new(2, Duration::from_secs(60), Some(Duration::from_secs(100)));
        assert_eq!(policy.time_until_next_retry(3, None), Duration::from_secs(100));
    }

    #[test]
    fn honors_preferred_interval_from_retry_after() {
        let policy = RetryPolicy::new(2, Duration::from_secs(60), Some(Duration::from_secs(300)));
        // Preferred interval larger than what back-off alone would produce.
        assert_eq!(
            policy.time_until_next_retry(0, Some(Duration::from_secs(200))),
            Duration::from_secs(200)
        );
        // Preferred interval beyond the maximum is clamped down.
        assert_eq!(
            policy.time_until_next_retry(0, Some(Duration::from_secs(1000))),
            Duration::from_secs(300)
        );
    }

    #[test]
    fn fixed_interval_never_grows() {
        let policy = fixed_interval(Duration::from_secs(300));
        assert_eq!(policy.time_until_next_retry(0, None), Duration::from_secs(300));
        assert_eq!(policy.time_until_next_retry(5, None), Duration::from_secs(300));
    }
}
