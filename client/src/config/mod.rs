//! Client settings.
//!
//! Settings come from built-in defaults, optionally overlaid by a TOML
//! document and then by `HUBSTREAM__*` environment variables, in that order.
//! [`ClientSettings::validate`] reports every value outside [`limits`].
//!
//! ```toml
//! operation_timeout_secs = 30
//! prefetch_count = 500
//!
//! [retry]
//! max_backoff_ms = 10000
//! max_retry_count = 5
//! ```

pub mod defaults;
pub mod limits;
pub mod validation;

pub use validation::{ConfigValidationError, validate_prefetch_count};

use crate::common::{MessagingError, MessagingResult};
use crate::retry::{DEFAULT_POLICY_NAME, NO_RETRY_POLICY_NAME, RetryExponential, RetryPolicy};
use crate::utils::{EnvUtils, EnvVarError};
use defaults::*;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientSettings {
    pub operation_timeout_secs: u64,
    pub prefetch_count: u32,
    /// Idle time after which a receive sends a one-credit ping flow.
    pub ping_idle_threshold_secs: u64,
    pub max_ping_credits: u32,
    pub link_close_timeout_secs: u64,
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    /// `Default` or `NoRetry`.
    pub policy: String,
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_retry_count: u32,
    pub jitter: f64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            operation_timeout_secs: DEFAULT_OPERATION_TIMEOUT_SECS,
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            ping_idle_threshold_secs: DEFAULT_PING_IDLE_THRESHOLD_SECS,
            max_ping_credits: DEFAULT_MAX_PING_CREDITS,
            link_close_timeout_secs: DEFAULT_LINK_CLOSE_TIMEOUT_SECS,
            retry: RetrySettings::default(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            policy: DEFAULT_POLICY_NAME.to_string(),
            min_backoff_ms: DEFAULT_MIN_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            jitter: 0.0,
        }
    }
}

impl ClientSettings {
    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(document: &str) -> MessagingResult<Self> {
        toml::from_str(document)
            .map_err(|e| MessagingError::Configuration(format!("Failed to parse settings: {e}")))
    }

    /// Defaults overlaid with environment overrides.
    pub fn from_env() -> MessagingResult<Self> {
        let mut settings = Self::default();
        settings.apply_env_overrides()?;
        Ok(settings)
    }

    /// Overlay `HUBSTREAM__<KEY>` and `HUBSTREAM__RETRY__<KEY>` variables.
    pub fn apply_env_overrides(&mut self) -> MessagingResult<()> {
        override_from_env(&mut self.operation_timeout_secs, &["OPERATION_TIMEOUT_SECS"])?;
        override_from_env(&mut self.prefetch_count, &["PREFETCH_COUNT"])?;
        override_from_env(&mut self.ping_idle_threshold_secs, &["PING_IDLE_THRESHOLD_SECS"])?;
        override_from_env(&mut self.max_ping_credits, &["MAX_PING_CREDITS"])?;
        override_from_env(&mut self.link_close_timeout_secs, &["LINK_CLOSE_TIMEOUT_SECS"])?;
        override_from_env(&mut self.retry.policy, &["RETRY", "POLICY"])?;
        override_from_env(&mut self.retry.min_backoff_ms, &["RETRY", "MIN_BACKOFF_MS"])?;
        override_from_env(&mut self.retry.max_backoff_ms, &["RETRY", "MAX_BACKOFF_MS"])?;
        override_from_env(&mut self.retry.max_retry_count, &["RETRY", "MAX_RETRY_COUNT"])?;
        override_from_env(&mut self.retry.jitter, &["RETRY", "JITTER"])?;
        Ok(())
    }

    /// Fail with the first limit violation, logging all of them.
    pub fn validate(&self) -> MessagingResult<()> {
        let errors = validation::validate(self);
        for error in &errors {
            log::warn!("Invalid setting {}: {error}", error.setting());
        }
        match errors.into_iter().next() {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn ping_idle_threshold(&self) -> Duration {
        Duration::from_secs(self.ping_idle_threshold_secs)
    }

    pub fn link_close_timeout(&self) -> Duration {
        Duration::from_secs(self.link_close_timeout_secs)
    }
}

impl RetrySettings {
    /// Build the policy these settings describe.
    pub fn build_policy(&self) -> MessagingResult<Arc<dyn RetryPolicy>> {
        let name = self.policy.trim();
        if name.eq_ignore_ascii_case(NO_RETRY_POLICY_NAME) {
            return Ok(crate::retry::no_retry());
        }
        if !name.eq_ignore_ascii_case(DEFAULT_POLICY_NAME) {
            return Err(MessagingError::Configuration(format!(
                "unknown retry policy '{name}'"
            )));
        }

        Ok(Arc::new(
            RetryExponential::new(
                Duration::from_millis(self.min_backoff_ms),
                Duration::from_millis(self.max_backoff_ms),
                self.max_retry_count,
                DEFAULT_POLICY_NAME,
            )
            .with_jitter(self.jitter),
        ))
    }
}

fn env_var_name(path: &[&str]) -> String {
    let mut name = ENV_PREFIX.to_string();
    for segment in path {
        name.push_str(ENV_SEPARATOR);
        name.push_str(segment);
    }
    name
}

fn override_from_env<T>(target: &mut T, path: &[&str]) -> MessagingResult<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let name = env_var_name(path);
    match EnvUtils::get_parsed_var::<T>(&name) {
        Ok(Some(value)) => {
            log::debug!("Setting overridden from {name}");
            *target = value;
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(e @ EnvVarError::Invalid { .. }) | Err(e @ EnvVarError::InvalidUtf8 { .. }) => {
            Err(MessagingError::Configuration(e.to_string()))
        }
        Err(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = ClientSettings::default();
        assert_ok!(settings.validate());
        assert_eq!(settings.operation_timeout(), Duration::from_secs(60));
        assert_eq!(settings.prefetch_count, 300);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings = assert_ok!(ClientSettings::from_toml_str(
            r#"
            prefetch_count = 500

            [retry]
            max_retry_count = 3
            "#
        ));

        assert_eq!(settings.prefetch_count, 500);
        assert_eq!(settings.retry.max_retry_count, 3);
        assert_eq!(settings.retry.max_backoff_ms, DEFAULT_MAX_BACKOFF_MS);
        assert_eq!(settings.operation_timeout_secs, DEFAULT_OPERATION_TIMEOUT_SECS);
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert_matches!(
            ClientSettings::from_toml_str("prefetch = 10"),
            Err(MessagingError::Configuration(_))
        );
    }

    #[test]
    fn test_validation_reports_every_violation() {
        let settings = ClientSettings {
            prefetch_count: 5,
            operation_timeout_secs: 0,
            retry: RetrySettings {
                min_backoff_ms: 10,
                max_backoff_ms: 5,
                jitter: 2.0,
                ..RetrySettings::default()
            },
            ..ClientSettings::default()
        };

        let errors = validation::validate(&settings);
        assert_eq!(errors.len(), 4);
        assert_matches!(&errors[0], ConfigValidationError::PrefetchCount { configured: 5, .. });
        assert_matches!(settings.validate(), Err(MessagingError::Configuration(_)));
    }

    #[test]
    fn test_prefetch_bounds_are_inclusive() {
        assert_ok!(validate_prefetch_count(limits::MIN_PREFETCH_COUNT));
        assert_ok!(validate_prefetch_count(limits::MAX_PREFETCH_COUNT));
        assert_err!(validate_prefetch_count(limits::MIN_PREFETCH_COUNT - 1));
        assert_err!(validate_prefetch_count(limits::MAX_PREFETCH_COUNT + 1));
    }

    #[test]
    fn test_retry_settings_build_named_policies() {
        let mut retry = RetrySettings::default();
        assert_eq!(assert_ok!(retry.build_policy()).name(), DEFAULT_POLICY_NAME);

        retry.policy = "noretry".to_string();
        assert_eq!(assert_ok!(retry.build_policy()).name(), NO_RETRY_POLICY_NAME);

        retry.policy = "Fibonacci".to_string();
        assert_err!(retry.build_policy());
    }

    #[test]
    fn test_env_var_names_use_double_underscore() {
        assert_eq!(env_var_name(&["PREFETCH_COUNT"]), "HUBSTREAM__PREFETCH_COUNT");
        assert_eq!(
            env_var_name(&["RETRY", "JITTER"]),
            "HUBSTREAM__RETRY__JITTER"
        );
    }
}
