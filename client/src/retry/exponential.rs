use super::{RetryCounters, RetryPolicy, SERVER_BUSY_BASE_WAIT, TIMER_TOLERANCE};
use crate::common::MessagingError;
use rand::Rng;
use std::time::Duration;

/// Exponential backoff between a minimum and maximum delay.
///
/// The delay for attempt `n` is `min + factor^n` milliseconds, where
/// `factor^max_retry_count` equals the spread between `min` and `max`. A
/// server-busy error adds [`SERVER_BUSY_BASE_WAIT`] before the result is
/// clamped to `max`.
#[derive(Debug)]
pub struct RetryExponential {
    name: String,
    min_backoff: Duration,
    max_backoff: Duration,
    max_retry_count: u32,
    retry_factor: f64,
    jitter: f64,
    counters: RetryCounters,
}

impl RetryExponential {
    pub fn new(
        min_backoff: Duration,
        max_backoff: Duration,
        max_retry_count: u32,
        name: impl Into<String>,
    ) -> Self {
        let max_backoff = max_backoff.max(min_backoff);
        Self {
            name: name.into(),
            min_backoff,
            max_backoff,
            max_retry_count,
            retry_factor: Self::compute_retry_factor(
                max_backoff - min_backoff,
                max_retry_count,
            ),
            jitter: 0.0,
            counters: RetryCounters::default(),
        }
    }

    /// Shorten each delay by a random fraction of up to `jitter`.
    ///
    /// Values are clamped to `[0, 1]`. Zero keeps the backoff monotonic.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn min_backoff(&self) -> Duration {
        self.min_backoff
    }

    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    pub fn max_retry_count(&self) -> u32 {
        self.max_retry_count
    }

    fn compute_retry_factor(delta: Duration, max_retry_count: u32) -> f64 {
        let delta_ms = delta.as_millis() as f64;
        if delta_ms <= 1.0 || max_retry_count == 0 {
            return 0.0;
        }
        (delta_ms.ln() / f64::from(max_retry_count)).exp()
    }

    fn exponential_term(&self, retry_count: u32) -> Duration {
        if self.retry_factor == 0.0 {
            return self.max_backoff - self.min_backoff;
        }
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let millis = self.retry_factor.powi(exponent);
        if millis.is_finite() {
            Duration::from_secs_f64(millis / 1000.0)
        } else {
            Duration::MAX
        }
    }
}

impl RetryPolicy for RetryExponential {
    fn name(&self) -> &str {
        &self.name
    }

    fn counters(&self) -> &RetryCounters {
        &self.counters
    }

    fn next_retry_interval(
        &self,
        client_id: &str,
        last_error: &MessagingError,
        remaining: Duration,
    ) -> Option<Duration> {
        if !last_error.is_transient() {
            return None;
        }

        let retry_count = self.retry_count(client_id);
        if retry_count >= self.max_retry_count {
            return None;
        }

        let base_wait = if last_error.is_server_busy() {
            SERVER_BUSY_BASE_WAIT
        } else {
            Duration::ZERO
        };

        let mut delay = self
            .min_backoff
            .saturating_add(self.exponential_term(retry_count))
            .saturating_add(base_wait)
            .min(self.max_backoff);

        if self.jitter > 0.0 {
            let shrink = rand::thread_rng().gen_range(0.0..=self.jitter);
            delay = delay.mul_f64(1.0 - shrink);
        }

        if remaining < delay.max(TIMER_TOLERANCE) {
            log::debug!(
                "Not retrying {client_id}: {remaining:?} left, next attempt needs {delay:?}"
            );
            return None;
        }

        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::*;
    use proptest::prelude::*;

    fn transient() -> MessagingError {
        MessagingError::LinkDetached("detached".into())
    }

    fn policy(min_ms: u64, max_ms: u64, count: u32) -> RetryExponential {
        RetryExponential::new(
            Duration::from_millis(min_ms),
            Duration::from_millis(max_ms),
            count,
            "test",
        )
    }

    mod unit {
        use super::*;

        #[test]
        fn test_permanent_error_is_never_retried() {
            let policy = policy(0, 30_000, 10);
            let error = MessagingError::Unauthorized("denied".into());
            assert_none!(policy.next_retry_interval("c", &error, Duration::from_secs(60)));
        }

        #[test]
        fn test_retries_stop_at_max_count() {
            let policy = policy(0, 30_000, 3);
            for _ in 0..3 {
                assert_some!(policy.next_retry_interval("c", &transient(), Duration::from_secs(60)));
                policy.increment_retry_count("c");
            }
            assert_none!(policy.next_retry_interval("c", &transient(), Duration::from_secs(60)));
        }

        #[test]
        fn test_small_remaining_budget_stops_retries() {
            let policy = policy(0, 30_000, 10);
            assert_none!(policy.next_retry_interval("c", &transient(), Duration::from_millis(500)));
        }

        #[test]
        fn test_server_busy_adds_base_wait() {
            let policy = policy(0, 30_000, 10);
            let busy = MessagingError::ServerBusy("busy".into());

            let plain = assert_some!(policy.next_retry_interval("c", &transient(), Duration::from_secs(60)));
            let throttled = assert_some!(policy.next_retry_interval("c", &busy, Duration::from_secs(60)));

            assert_eq!(throttled, plain + SERVER_BUSY_BASE_WAIT);
        }

        #[test]
        fn test_delay_never_exceeds_max_backoff() {
            let policy = policy(0, 2_000, 10);
            let busy = MessagingError::ServerBusy("busy".into());
            let delay = assert_some!(policy.next_retry_interval("c", &busy, Duration::from_secs(60)));
            assert_eq!(delay, Duration::from_secs(2));
        }

        #[test]
        fn test_late_attempts_approach_max_backoff() {
            let policy = policy(0, 30_000, 10);
            for _ in 0..9 {
                policy.increment_retry_count("c");
            }
            let delay = assert_some!(policy.next_retry_interval("c", &transient(), Duration::from_secs(60)));
            assert_ge!(delay, Duration::from_secs(10));
            assert_lt!(delay, Duration::from_secs(30));
        }

        #[test]
        fn test_jitter_only_shortens_delay() {
            let policy = policy(0, 30_000, 10).with_jitter(0.5);
            for _ in 0..9 {
                policy.increment_retry_count("c");
            }
            let delay = assert_some!(policy.next_retry_interval("c", &transient(), Duration::from_secs(60)));
            assert_le!(delay, Duration::from_secs(30));
        }
    }

    proptest! {
        #[test]
        fn test_transient_retry_until_budget_or_count_exhausted(
            min_ms in 0u64..5_000,
            spread_ms in 2u64..60_000,
            max_count in 1u32..20,
            attempts in 0u32..25,
            remaining_ms in 0u64..120_000,
        ) {
            let policy = policy(min_ms, min_ms + spread_ms, max_count);
            for _ in 0..attempts {
                policy.increment_retry_count("p");
            }
            let remaining = Duration::from_millis(remaining_ms);

            match policy.next_retry_interval("p", &transient(), remaining) {
                Some(delay) => {
                    prop_assert!(attempts < max_count);
                    prop_assert!(delay <= policy.max_backoff());
                    prop_assert!(delay >= policy.min_backoff());
                    prop_assert!(remaining >= delay.max(TIMER_TOLERANCE));
                }
                None => {
                    let delay = policy
                        .min_backoff()
                        .saturating_add(policy.exponential_term(attempts.min(max_count)));
                    let delay = delay.min(policy.max_backoff());
                    prop_assert!(attempts >= max_count || remaining < delay.max(TIMER_TOLERANCE));
                }
            }
        }

        #[test]
        fn test_backoff_is_non_decreasing_in_retry_count(
            min_ms in 0u64..5_000,
            spread_ms in 2u64..60_000,
            max_count in 1u32..20,
        ) {
            let policy = policy(min_ms, min_ms + spread_ms, max_count);
            let budget = Duration::from_secs(3_600);
            let mut previous = Duration::ZERO;

            for _ in 0..max_count {
                let delay = policy.next_retry_interval("m", &transient(), budget);
                prop_assert!(delay.is_some());
                let delay = delay.unwrap_or_default();
                prop_assert!(delay >= previous);
                previous = delay;
                policy.increment_retry_count("m");
            }
        }
    }
}
