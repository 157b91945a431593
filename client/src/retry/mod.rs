//! Retry policies for link recovery.
//!
//! A policy decides, per client id, whether a failed operation should be
//! attempted again and how long to wait first. Counters are kept per client
//! id, so one policy instance can be shared by every receiver of a factory.

mod exponential;

pub use exponential::RetryExponential;

use crate::common::{MessagingError, MessagingResult};
use crate::utils::sync::lock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Name of the policy returned by [`default_policy`].
pub const DEFAULT_POLICY_NAME: &str = "Default";
/// Name of the policy returned by [`no_retry`].
pub const NO_RETRY_POLICY_NAME: &str = "NoRetry";

pub const DEFAULT_MIN_BACKOFF: Duration = Duration::ZERO;
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_RETRY_COUNT: u32 = 10;

/// Added to the computed delay when the service reports it is busy.
pub const SERVER_BUSY_BASE_WAIT: Duration = Duration::from_secs(4);

/// Smallest remaining budget worth scheduling a retry into.
pub const TIMER_TOLERANCE: Duration = Duration::from_secs(1);

/// Decides whether and when a failed operation is retried.
pub trait RetryPolicy: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    /// Per-client attempt counters backing the provided methods.
    fn counters(&self) -> &RetryCounters;

    /// Delay before the next attempt, or `None` to stop retrying.
    ///
    /// `remaining` is what is left of the caller's operation budget.
    fn next_retry_interval(
        &self,
        client_id: &str,
        last_error: &MessagingError,
        remaining: Duration,
    ) -> Option<Duration>;

    fn increment_retry_count(&self, client_id: &str) {
        self.counters().increment(client_id);
    }

    fn reset_retry_count(&self, client_id: &str) {
        self.counters().reset(client_id);
    }

    fn retry_count(&self, client_id: &str) -> u32 {
        self.counters().get(client_id)
    }
}

/// Attempt counters keyed by client id.
#[derive(Debug, Default)]
pub struct RetryCounters {
    counts: Mutex<HashMap<String, u32>>,
}

impl RetryCounters {
    pub fn get(&self, client_id: &str) -> u32 {
        lock(&self.counts).get(client_id).copied().unwrap_or(0)
    }

    pub fn increment(&self, client_id: &str) {
        let mut counts = lock(&self.counts);
        let count = counts.entry(client_id.to_string()).or_insert(0);
        *count = count.saturating_add(1);
    }

    pub fn reset(&self, client_id: &str) {
        lock(&self.counts).remove(client_id);
    }
}

/// Exponential backoff with the library defaults.
pub fn default_policy() -> Arc<dyn RetryPolicy> {
    Arc::new(RetryExponential::new(
        DEFAULT_MIN_BACKOFF,
        DEFAULT_MAX_BACKOFF,
        DEFAULT_MAX_RETRY_COUNT,
        DEFAULT_POLICY_NAME,
    ))
}

/// A policy that never retries.
pub fn no_retry() -> Arc<dyn RetryPolicy> {
    Arc::new(RetryExponential::new(
        Duration::ZERO,
        Duration::ZERO,
        0,
        NO_RETRY_POLICY_NAME,
    ))
}

/// Resolve a policy by the name used in connection strings.
pub fn policy_from_name(name: &str) -> MessagingResult<Arc<dyn RetryPolicy>> {
    match name.trim() {
        n if n.eq_ignore_ascii_case(DEFAULT_POLICY_NAME) => Ok(default_policy()),
        n if n.eq_ignore_ascii_case(NO_RETRY_POLICY_NAME) => Ok(no_retry()),
        other => Err(MessagingError::Configuration(format!(
            "unknown retry policy '{other}'"
        ))),
    }
}

/// Whether `error` is a transient error eligible for retry.
///
/// Mirrors the wire-level contract: asking about a missing error is an
/// argument error rather than `false`.
pub fn is_retryable_error(error: Option<&MessagingError>) -> MessagingResult<bool> {
    match error {
        Some(error) => Ok(error.is_transient()),
        None => Err(MessagingError::InvalidArgument(
            "an error is required to decide retryability".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::*;

    #[test]
    fn test_counters_are_per_client() {
        let policy = default_policy();
        policy.increment_retry_count("a");
        policy.increment_retry_count("a");
        policy.increment_retry_count("b");

        assert_eq!(policy.retry_count("a"), 2);
        assert_eq!(policy.retry_count("b"), 1);

        policy.reset_retry_count("a");
        assert_eq!(policy.retry_count("a"), 0);
        assert_eq!(policy.retry_count("b"), 1);
    }

    #[test]
    fn test_no_retry_never_retries() {
        let policy = no_retry();
        let error = MessagingError::ServerBusy("busy".into());
        assert_none!(policy.next_retry_interval("c", &error, Duration::from_secs(60)));
        assert_eq!(policy.name(), NO_RETRY_POLICY_NAME);
    }

    #[test]
    fn test_policy_lookup_by_name() {
        assert_eq!(assert_ok!(policy_from_name("default")).name(), DEFAULT_POLICY_NAME);
        assert_eq!(assert_ok!(policy_from_name(" NoRetry ")).name(), NO_RETRY_POLICY_NAME);
        assert_matches!(
            policy_from_name("Linear"),
            Err(MessagingError::Configuration(_))
        );
    }

    #[test]
    fn test_is_retryable_error() {
        let busy = MessagingError::ServerBusy("busy".into());
        let denied = MessagingError::Unauthorized("denied".into());

        assert!(assert_ok!(is_retryable_error(Some(&busy))));
        assert!(!assert_ok!(is_retryable_error(Some(&denied))));
        assert_matches!(
            is_retryable_error(None),
            Err(MessagingError::InvalidArgument(_))
        );
    }
}
