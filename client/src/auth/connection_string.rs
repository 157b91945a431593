use crate::common::{MessagingError, MessagingResult};
use std::fmt;
use std::time::Duration;
use zeroize::Zeroizing;

const ENDPOINT_KEY: &str = "Endpoint";
const KEY_NAME_KEY: &str = "SharedAccessKeyName";
const KEY_KEY: &str = "SharedAccessKey";
const ENTITY_PATH_KEY: &str = "EntityPath";
const OPERATION_TIMEOUT_KEY: &str = "OperationTimeout";
const RETRY_POLICY_KEY: &str = "RetryPolicy";

const DEFAULT_DOMAIN: &str = "servicebus.windows.net";

/// Parsed form of a `Key=Value;Key=Value` connection string.
///
/// Keys are matched case-insensitively. `OperationTimeout` accepts either a
/// number of seconds or an ISO-8601 duration such as `PT1M30S`.
///
/// # Examples
///
/// ```no_run
/// use client::auth::ConnectionStringBuilder;
///
/// let builder = ConnectionStringBuilder::parse(
///     "Endpoint=sb://my-hub.servicebus.windows.net/;SharedAccessKeyName=listen;SharedAccessKey=abc=;EntityPath=telemetry",
/// )?;
/// assert_eq!(builder.host_name(), "my-hub.servicebus.windows.net");
/// ```
#[derive(Clone)]
pub struct ConnectionStringBuilder {
    host_name: String,
    shared_access_key_name: String,
    shared_access_key: Zeroizing<String>,
    entity_path: Option<String>,
    operation_timeout: Option<Duration>,
    retry_policy: Option<String>,
}

impl ConnectionStringBuilder {
    /// Build from a namespace name and the default service domain.
    pub fn new(
        namespace: &str,
        entity_path: &str,
        shared_access_key_name: &str,
        shared_access_key: &str,
    ) -> Self {
        Self {
            host_name: format!("{namespace}.{DEFAULT_DOMAIN}"),
            shared_access_key_name: shared_access_key_name.to_string(),
            shared_access_key: Zeroizing::new(shared_access_key.to_string()),
            entity_path: Some(entity_path.to_string()).filter(|p| !p.is_empty()),
            operation_timeout: None,
            retry_policy: None,
        }
    }

    pub fn parse(connection_string: &str) -> MessagingResult<Self> {
        if connection_string.trim().is_empty() {
            return Err(MessagingError::Configuration(
                "Connection string cannot be empty".to_string(),
            ));
        }

        let mut host_name = None;
        let mut key_name = None;
        let mut key = None;
        let mut entity_path = None;
        let mut operation_timeout = None;
        let mut retry_policy = None;

        for part in connection_string.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            // Values may end in base64 '=' padding, so split on the first one only.
            let Some((name, value)) = part.split_once('=') else {
                return Err(MessagingError::Configuration(format!(
                    "Malformed connection string segment '{part}'"
                )));
            };
            let value = value.trim();

            match name.trim() {
                n if n.eq_ignore_ascii_case(ENDPOINT_KEY) => {
                    host_name = Some(parse_endpoint(value)?);
                }
                n if n.eq_ignore_ascii_case(KEY_NAME_KEY) => key_name = Some(value.to_string()),
                n if n.eq_ignore_ascii_case(KEY_KEY) => key = Some(value.to_string()),
                n if n.eq_ignore_ascii_case(ENTITY_PATH_KEY) => {
                    entity_path = Some(value.to_string());
                }
                n if n.eq_ignore_ascii_case(OPERATION_TIMEOUT_KEY) => {
                    operation_timeout = Some(parse_timeout(value)?);
                }
                n if n.eq_ignore_ascii_case(RETRY_POLICY_KEY) => {
                    retry_policy = Some(value.to_string());
                }
                other => {
                    return Err(MessagingError::Configuration(format!(
                        "Unknown connection string key '{other}'"
                    )));
                }
            }
        }

        let host_name = host_name.ok_or_else(|| {
            MessagingError::Configuration("Missing Endpoint in connection string".to_string())
        })?;
        let shared_access_key_name = key_name.ok_or_else(|| {
            MessagingError::Configuration(
                "Missing SharedAccessKeyName in connection string".to_string(),
            )
        })?;
        let shared_access_key = key.ok_or_else(|| {
            MessagingError::Configuration(
                "Missing SharedAccessKey in connection string".to_string(),
            )
        })?;

        Ok(Self {
            host_name,
            shared_access_key_name,
            shared_access_key: Zeroizing::new(shared_access_key),
            entity_path,
            operation_timeout,
            retry_policy,
        })
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn shared_access_key_name(&self) -> &str {
        &self.shared_access_key_name
    }

    pub fn shared_access_key(&self) -> &str {
        &self.shared_access_key
    }

    pub fn entity_path(&self) -> Option<&str> {
        self.entity_path.as_deref()
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout
    }

    pub fn retry_policy(&self) -> Option<&str> {
        self.retry_policy.as_deref()
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    pub fn with_retry_policy(mut self, name: impl Into<String>) -> Self {
        self.retry_policy = Some(name.into());
        self
    }
}

impl fmt::Display for ConnectionStringBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{ENDPOINT_KEY}=sb://{}/;{KEY_NAME_KEY}={};{KEY_KEY}={}",
            self.host_name,
            self.shared_access_key_name,
            self.shared_access_key.as_str()
        )?;
        if let Some(entity_path) = &self.entity_path {
            write!(f, ";{ENTITY_PATH_KEY}={entity_path}")?;
        }
        if let Some(timeout) = self.operation_timeout {
            write!(f, ";{OPERATION_TIMEOUT_KEY}={}", format_timeout(timeout))?;
        }
        if let Some(retry_policy) = &self.retry_policy {
            write!(f, ";{RETRY_POLICY_KEY}={retry_policy}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionStringBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStringBuilder")
            .field("host_name", &self.host_name)
            .field("shared_access_key_name", &self.shared_access_key_name)
            .field("shared_access_key", &"<redacted>")
            .field("entity_path", &self.entity_path)
            .field("operation_timeout", &self.operation_timeout)
            .field("retry_policy", &self.retry_policy)
            .finish()
    }
}

fn parse_endpoint(value: &str) -> MessagingResult<String> {
    let without_scheme = match value.find("://") {
        Some(index) => &value[index + 3..],
        None => value,
    };
    let host = without_scheme.trim_end_matches('/');
    if host.is_empty() || host.contains('/') {
        return Err(MessagingError::Configuration(format!(
            "Invalid Endpoint '{value}'"
        )));
    }
    Ok(host.to_string())
}

/// Accepts plain seconds (`60`, `1.5`) or an ISO-8601 time duration (`PT1H2M3.5S`).
fn parse_timeout(value: &str) -> MessagingResult<Duration> {
    let invalid = || MessagingError::Configuration(format!("Invalid OperationTimeout '{value}'"));

    if let Ok(seconds) = value.parse::<f64>() {
        return Duration::try_from_secs_f64(seconds).map_err(|_| invalid());
    }

    let upper = value.to_ascii_uppercase();
    let body = upper.strip_prefix("PT").ok_or_else(invalid)?;
    if body.is_empty() {
        return Err(invalid());
    }

    let mut total = 0.0_f64;
    let mut number = String::new();
    for c in body.chars() {
        match c {
            '0'..='9' | '.' => number.push(c),
            'H' | 'M' | 'S' => {
                let amount: f64 = number.parse().map_err(|_| invalid())?;
                let unit = match c {
                    'H' => 3600.0,
                    'M' => 60.0,
                    _ => 1.0,
                };
                total += amount * unit;
                number.clear();
            }
            _ => return Err(invalid()),
        }
    }
    if !number.is_empty() {
        return Err(invalid());
    }

    Duration::try_from_secs_f64(total).map_err(|_| invalid())
}

fn format_timeout(timeout: Duration) -> String {
    if timeout.subsec_millis() == 0 {
        format!("PT{}S", timeout.as_secs())
    } else {
        format!("PT{}.{:03}S", timeout.as_secs(), timeout.subsec_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::*;

    const FULL: &str = "Endpoint=sb://hub.example.net/;SharedAccessKeyName=listen;SharedAccessKey=c2VjcmV0=;EntityPath=telemetry;OperationTimeout=PT1M30S;RetryPolicy=NoRetry";

    #[test]
    fn test_parse_full_connection_string() {
        let builder = assert_ok!(ConnectionStringBuilder::parse(FULL));

        assert_eq!(builder.host_name(), "hub.example.net");
        assert_eq!(builder.shared_access_key_name(), "listen");
        assert_eq!(builder.shared_access_key(), "c2VjcmV0=");
        assert_eq!(builder.entity_path(), Some("telemetry"));
        assert_eq!(builder.operation_timeout(), Some(Duration::from_secs(90)));
        assert_eq!(builder.retry_policy(), Some("NoRetry"));
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        let builder = assert_ok!(ConnectionStringBuilder::parse(FULL));
        let reparsed = assert_ok!(ConnectionStringBuilder::parse(&builder.to_string()));

        assert_eq!(reparsed.to_string(), builder.to_string());
        assert_eq!(reparsed.operation_timeout(), Some(Duration::from_secs(90)));
    }

    #[test]
    fn test_keys_are_case_insensitive_and_timeout_accepts_seconds() {
        let builder = assert_ok!(ConnectionStringBuilder::parse(
            "endpoint=sb://hub.example.net;sharedaccesskeyname=k;sharedaccesskey=v;operationtimeout=2.5"
        ));
        assert_eq!(builder.operation_timeout(), Some(Duration::from_millis(2500)));
        assert_none!(builder.entity_path());
    }

    #[test]
    fn test_missing_fields_are_reported() {
        assert_matches!(
            ConnectionStringBuilder::parse("SharedAccessKeyName=k;SharedAccessKey=v"),
            Err(MessagingError::Configuration(msg)) if msg.contains("Endpoint")
        );
        assert_matches!(
            ConnectionStringBuilder::parse("Endpoint=sb://h/;SharedAccessKey=v"),
            Err(MessagingError::Configuration(msg)) if msg.contains("SharedAccessKeyName")
        );
        assert_matches!(
            ConnectionStringBuilder::parse(""),
            Err(MessagingError::Configuration(_))
        );
    }

    #[test]
    fn test_invalid_timeout_is_rejected() {
        for bad in ["PT", "PT5X", "P1D", "-3", "PT5"] {
            let cs = format!("Endpoint=sb://h/;SharedAccessKeyName=k;SharedAccessKey=v;OperationTimeout={bad}");
            assert_err!(ConnectionStringBuilder::parse(&cs), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_new_uses_default_domain() {
        let builder = ConnectionStringBuilder::new("my-hub", "telemetry", "listen", "key");
        assert_eq!(builder.host_name(), "my-hub.servicebus.windows.net");
        assert!(!format!("{builder:?}").contains("\"key\""));
    }
}
