use super::errors::{MessagingError, MessagingResult};
use std::time::Duration;
use tokio::time::Instant;

/// Tracks elapsed and remaining time against an operation deadline.
///
/// The clock starts either at construction or lazily on the first call to
/// [`elapsed`](TimeoutTracker::elapsed). Not synchronized; owners guard it.
///
/// Reads tokio's clock, so a paused test runtime controls expiry.
#[derive(Debug, Clone)]
pub struct TimeoutTracker {
    original_timeout: Duration,
    started_at: Option<Instant>,
}

impl TimeoutTracker {
    pub fn new(timeout: Duration, start_now: bool) -> Self {
        Self {
            original_timeout: timeout,
            started_at: start_now.then(Instant::now),
        }
    }

    /// Tracker whose clock starts immediately.
    pub fn start(timeout: Duration) -> Self {
        Self::new(timeout, true)
    }

    /// Build a tracker from a signed millisecond count, as found in
    /// connection strings and configuration files.
    pub fn from_millis(timeout_ms: i64, start_now: bool) -> MessagingResult<Self> {
        if timeout_ms < 0 {
            return Err(MessagingError::InvalidArgument(format!(
                "timeout must be non-negative, got {timeout_ms}ms"
            )));
        }
        Ok(Self::new(Duration::from_millis(timeout_ms as u64), start_now))
    }

    pub fn original_timeout(&self) -> Duration {
        self.original_timeout
    }

    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn elapsed(&mut self) -> Duration {
        let started_at = *self.started_at.get_or_insert_with(Instant::now);
        started_at.elapsed()
    }

    /// Remaining time in milliseconds; negative once the deadline passed.
    pub fn remaining_millis(&mut self) -> i128 {
        self.original_timeout.as_millis() as i128 - self.elapsed().as_millis() as i128
    }

    /// Remaining time clamped at zero.
    pub fn remaining(&mut self) -> Duration {
        self.original_timeout.saturating_sub(self.elapsed())
    }

    pub fn is_expired(&mut self) -> bool {
        self.elapsed() >= self.original_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::*;

    #[test]
    fn test_negative_timeout_is_rejected() {
        let result = TimeoutTracker::from_millis(-1, true);
        assert_matches!(result, Err(MessagingError::InvalidArgument(_)));
    }

    #[test]
    fn test_clock_starts_lazily() {
        let mut tracker = TimeoutTracker::new(Duration::from_secs(5), false);
        assert!(!tracker.is_started());

        let _ = tracker.elapsed();
        assert!(tracker.is_started());
    }

    #[test]
    fn test_remaining_goes_negative_after_expiry() {
        let mut tracker = assert_ok!(TimeoutTracker::from_millis(0, true));
        std::thread::sleep(Duration::from_millis(5));

        assert!(tracker.is_expired());
        assert_le!(tracker.remaining_millis(), 0);
        assert_eq!(tracker.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_remaining_never_exceeds_original() {
        let mut tracker = TimeoutTracker::start(Duration::from_secs(30));
        assert_le!(tracker.remaining(), Duration::from_secs(30));
        assert_eq!(tracker.original_timeout(), Duration::from_secs(30));
    }
}
