use crate::common::{MessagingError, MessagingResult};
use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Generator for Shared Access Signature (SAS) tokens.
///
/// Creates time-limited tokens signed with HMAC-SHA256 over the URL-encoded
/// resource URI and the expiry timestamp. The token is presented when a
/// connection is opened, so the shared access key itself never leaves the
/// process.
///
/// # Examples
///
/// ```no_run
/// use client::auth::SasTokenGenerator;
///
/// let generator = SasTokenGenerator::new("my-hub.servicebus.windows.net");
/// let token = generator.generate_sas_token(
///     "RootManageSharedAccessKey",
///     "shared_access_key",
///     chrono::Duration::hours(1),
/// )?;
/// ```
#[derive(Debug, Clone)]
pub struct SasTokenGenerator {
    host_name: String,
}

impl SasTokenGenerator {
    /// Creates a generator for resources under `host_name`.
    pub fn new(host_name: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
        }
    }

    pub fn resource_uri(&self) -> String {
        format!("sb://{}/", self.host_name)
    }

    /// Generates a SAS token valid for `validity` from now.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Authentication`] if the key name or key is
    /// empty, or if the HMAC cannot be initialized.
    pub fn generate_sas_token(
        &self,
        key_name: &str,
        key: &str,
        validity: Duration,
    ) -> MessagingResult<String> {
        self.generate_sas_token_expiring_at(key_name, key, Utc::now() + validity)
    }

    /// Generates a SAS token with an explicit expiry.
    pub fn generate_sas_token_expiring_at(
        &self,
        key_name: &str,
        key: &str,
        expiry: DateTime<Utc>,
    ) -> MessagingResult<String> {
        if key_name.is_empty() || key.is_empty() {
            return Err(MessagingError::Authentication(
                "shared access key name and key are required".to_string(),
            ));
        }

        let expiry_timestamp = expiry.timestamp();
        let resource_uri = self.resource_uri();
        let encoded_uri = urlencoding::encode(&resource_uri);
        let string_to_sign = format!("{encoded_uri}\n{expiry_timestamp}");

        let mut mac = HmacSha256::new_from_slice(key.as_bytes()).map_err(|e| {
            MessagingError::Authentication(format!("Failed to create HMAC: {e}"))
        })?;
        mac.update(string_to_sign.as_bytes());
        let signature = general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        Ok(format!(
            "SharedAccessSignature sr={}&sig={}&se={}&skn={}",
            encoded_uri,
            urlencoding::encode(&signature),
            expiry_timestamp,
            key_name
        ))
    }
}
