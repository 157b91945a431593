//! Environment variable utilities for safe and validated access.
//!
//! Settings overrides and connection strings can come from the process
//! environment. Values are trimmed and must be non-empty to count as set.

use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur when accessing environment variables.
#[derive(Debug, Error)]
pub enum EnvVarError {
    /// Environment variable is not set
    #[error("Environment variable '{name}' not found")]
    NotFound { name: String },

    /// Environment variable contains invalid UTF-8 characters
    #[error("Environment variable '{name}' contains invalid UTF-8 characters")]
    InvalidUtf8 { name: String },

    /// Environment variable is set but contains only whitespace or is empty
    #[error("Environment variable '{name}' is empty")]
    Empty { name: String },

    /// Environment variable is set but cannot be parsed into the target type
    #[error("Environment variable '{name}' has an invalid value '{value}': {reason}")]
    Invalid {
        name: String,
        value: String,
        reason: String,
    },
}

/// Utility functions for safe environment variable handling.
///
/// # Examples
///
/// ```no_run
/// use client::utils::EnvUtils;
///
/// let prefetch: Option<u32> = EnvUtils::get_parsed_var("HUBSTREAM__PREFETCH_COUNT")?;
/// ```
pub struct EnvUtils;

impl EnvUtils {
    /// Checks if an environment variable exists and has a non-empty value.
    pub fn has_non_empty_var(name: &str) -> bool {
        match std::env::var(name) {
            Ok(value) => !value.trim().is_empty(),
            Err(_) => false,
        }
    }

    /// Gets an environment variable with validation.
    ///
    /// # Errors
    ///
    /// Returns [`EnvVarError`] if:
    /// - The variable is not set ([`EnvVarError::NotFound`])
    /// - The variable is empty or contains only whitespace ([`EnvVarError::Empty`])
    /// - The variable contains invalid UTF-8 ([`EnvVarError::InvalidUtf8`])
    pub fn get_validated_var(name: &str) -> Result<String, EnvVarError> {
        match std::env::var(name) {
            Ok(value) => {
                let trimmed = value.trim();
                if trimmed.is_empty() {
                    Err(EnvVarError::Empty {
                        name: name.to_string(),
                    })
                } else {
                    Ok(trimmed.to_string())
                }
            }
            Err(std::env::VarError::NotPresent) => Err(EnvVarError::NotFound {
                name: name.to_string(),
            }),
            Err(std::env::VarError::NotUnicode(_)) => Err(EnvVarError::InvalidUtf8 {
                name: name.to_string(),
            }),
        }
    }

    /// Gets an optional environment variable.
    ///
    /// Returns `None` when the variable is missing, empty or not valid UTF-8.
    pub fn get_optional_var(name: &str) -> Option<String> {
        Self::get_validated_var(name).ok()
    }

    /// Gets and parses an optional environment variable.
    ///
    /// A missing or empty variable is `Ok(None)`; a present value that does
    /// not parse is an error rather than a silent fallback to the default.
    pub fn get_parsed_var<T>(name: &str) -> Result<Option<T>, EnvVarError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match Self::get_validated_var(name) {
            Ok(value) => value
                .parse::<T>()
                .map(Some)
                .map_err(|e| EnvVarError::Invalid {
                    name: name.to_string(),
                    value,
                    reason: e.to_string(),
                }),
            Err(EnvVarError::NotFound { .. }) | Err(EnvVarError::Empty { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::*;

    #[test]
    fn test_missing_var_is_not_found() {
        let result = EnvUtils::get_validated_var("HUBSTREAM_TEST_SURELY_UNSET_VAR");
        assert_matches!(result, Err(EnvVarError::NotFound { .. }));
        assert!(!EnvUtils::has_non_empty_var("HUBSTREAM_TEST_SURELY_UNSET_VAR"));
    }

    #[test]
    fn test_missing_var_parses_to_none() {
        let value: Option<u32> = assert_ok!(EnvUtils::get_parsed_var(
            "HUBSTREAM_TEST_SURELY_UNSET_NUMBER"
        ));
        assert_none!(value);
    }
}
