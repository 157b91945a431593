use super::ClientSettings;
use super::limits::*;
use crate::common::MessagingError;

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Invalid prefetch_count: {configured} (min: {min_limit}, max: {max_limit})")]
    PrefetchCount {
        configured: u32,
        min_limit: u32,
        max_limit: u32,
    },
    #[error("Invalid operation_timeout_secs: {configured} (min: 1, max: {limit})")]
    OperationTimeout { configured: u64, limit: u64 },
    #[error("Invalid link_close_timeout_secs: {configured} (min: 1, max: {limit})")]
    LinkCloseTimeout { configured: u64, limit: u64 },
    #[error("Invalid max_ping_credits: {configured} (limit: {limit})")]
    PingCredits { configured: u32, limit: u32 },
    #[error("Invalid retry.max_retry_count: {configured} (limit: {limit})")]
    RetryCount { configured: u32, limit: u32 },
    #[error("Invalid retry backoff: min {min_ms}ms, max {max_ms}ms (limit: {limit}ms)")]
    Backoff { min_ms: u64, max_ms: u64, limit: u64 },
    #[error("Invalid retry.jitter: {configured} (expected 0.0 - 1.0)")]
    Jitter { configured: f64 },
}

impl ConfigValidationError {
    /// Name of the offending setting as written in the TOML file.
    pub fn setting(&self) -> &'static str {
        match self {
            ConfigValidationError::PrefetchCount { .. } => "prefetch_count",
            ConfigValidationError::OperationTimeout { .. } => "operation_timeout_secs",
            ConfigValidationError::LinkCloseTimeout { .. } => "link_close_timeout_secs",
            ConfigValidationError::PingCredits { .. } => "max_ping_credits",
            ConfigValidationError::RetryCount { .. } => "retry.max_retry_count",
            ConfigValidationError::Backoff { .. } => "retry.max_backoff_ms",
            ConfigValidationError::Jitter { .. } => "retry.jitter",
        }
    }
}

impl From<ConfigValidationError> for MessagingError {
    fn from(err: ConfigValidationError) -> Self {
        MessagingError::Configuration(err.to_string())
    }
}

/// Check the prefetch window a receiver will use.
pub fn validate_prefetch_count(prefetch_count: u32) -> Result<(), ConfigValidationError> {
    if !(MIN_PREFETCH_COUNT..=MAX_PREFETCH_COUNT).contains(&prefetch_count) {
        return Err(ConfigValidationError::PrefetchCount {
            configured: prefetch_count,
            min_limit: MIN_PREFETCH_COUNT,
            max_limit: MAX_PREFETCH_COUNT,
        });
    }
    Ok(())
}

/// Collect every limit violation in `settings`.
pub fn validate(settings: &ClientSettings) -> Vec<ConfigValidationError> {
    let mut errors = Vec::new();

    if let Err(e) = validate_prefetch_count(settings.prefetch_count) {
        errors.push(e);
    }

    if settings.operation_timeout_secs == 0
        || settings.operation_timeout_secs > MAX_OPERATION_TIMEOUT_SECS
    {
        errors.push(ConfigValidationError::OperationTimeout {
            configured: settings.operation_timeout_secs,
            limit: MAX_OPERATION_TIMEOUT_SECS,
        });
    }

    if settings.link_close_timeout_secs == 0
        || settings.link_close_timeout_secs > MAX_OPERATION_TIMEOUT_SECS
    {
        errors.push(ConfigValidationError::LinkCloseTimeout {
            configured: settings.link_close_timeout_secs,
            limit: MAX_OPERATION_TIMEOUT_SECS,
        });
    }

    if settings.max_ping_credits > MAX_PING_CREDITS {
        errors.push(ConfigValidationError::PingCredits {
            configured: settings.max_ping_credits,
            limit: MAX_PING_CREDITS,
        });
    }

    let retry = &settings.retry;
    if retry.max_retry_count > MAX_RETRY_COUNT {
        errors.push(ConfigValidationError::RetryCount {
            configured: retry.max_retry_count,
            limit: MAX_RETRY_COUNT,
        });
    }

    if retry.min_backoff_ms > retry.max_backoff_ms || retry.max_backoff_ms > MAX_BACKOFF_MS {
        errors.push(ConfigValidationError::Backoff {
            min_ms: retry.min_backoff_ms,
            max_ms: retry.max_backoff_ms,
            limit: MAX_BACKOFF_MS,
        });
    }

    if !(0.0..=1.0).contains(&retry.jitter) {
        errors.push(ConfigValidationError::Jitter {
            configured: retry.jitter,
        });
    }

    errors
}
