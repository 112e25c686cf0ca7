//! AWS plumbing shared by federation-based providers: request signing,
//! STS role assumption, and the metadata block tenants submit.

pub mod sigv4;
pub mod sts;

use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::types::CredentialPayload;
use super::IntegrationError;

pub const DEFAULT_SESSION_DURATION_SECS: u64 = 3600;

/// Static or temporary AWS credentials.
#[derive(Clone, PartialEq)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub expiration: Option<DateTime<Utc>>,
}

impl fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .field("session_token", &self.session_token.as_ref().map(|_| "[REDACTED]"))
            .field("expiration", &self.expiration)
            .finish()
    }
}

impl AwsCredentials {
    /// Base credentials carried by a minted federation payload.
    pub fn from_payload(payload: &CredentialPayload) -> Option<Self> {
        let set = payload.credential_set.as_ref()?;
        let access_key_id = set.access_key_id.clone().filter(|s| !s.is_empty())?;
        let secret_access_key = set.secret_access_key.clone().filter(|s| !s.is_empty())?;
        Some(Self {
            access_key_id,
            secret_access_key,
            session_token: set.session_token.clone().filter(|s| !s.is_empty()),
            expiration: None,
        })
    }
}

/// Federation metadata lifted from `provider_data`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AwsMetadata {
    pub role_arn: String,
    pub region: String,
    pub external_id: Option<String>,
    pub session_name: String,
    pub session_duration: Option<u64>,
    pub account_id: Option<String>,
    /// Service endpoint override, mostly for VPC endpoints and tests.
    pub endpoint_url: Option<String>,
    pub sts_endpoint: Option<String>,
}

/// Keys accepted in an AWS federation `provider_data` block.
pub const METADATA_KEYS: &[&str] = &[
    "role_arn",
    "region",
    "external_id",
    "session_name",
    "session_duration",
    "account_id",
    "endpoint_url",
    "sts_endpoint",
];

/// Keys that hold base credentials. They are moved out of `provider_data`
/// into the encrypted credential columns during mint.
pub const SECRET_KEYS: &[&str] = &["access_key_id", "secret_access_key", "session_token"];

impl AwsMetadata {
    pub fn from_provider_data(
        data: &Map<String, Value>,
        default_session: &str,
    ) -> Result<Self, IntegrationError> {
        let role_arn = string_field(data, "role_arn")
            .ok_or_else(|| IntegrationError::MetadataMissing("role_arn".into()))?;
        let region = string_field(data, "region")
            .ok_or_else(|| IntegrationError::MetadataMissing("region".into()))?;

        Ok(Self {
            role_arn,
            region,
            external_id: string_field(data, "external_id"),
            session_name: string_field(data, "session_name")
                .unwrap_or_else(|| default_session.to_string()),
            session_duration: duration_field(data, "session_duration")?,
            account_id: string_field(data, "account_id"),
            endpoint_url: string_field(data, "endpoint_url"),
            sts_endpoint: string_field(data, "sts_endpoint"),
        })
    }

    pub fn session_duration_secs(&self) -> u64 {
        self.session_duration.unwrap_or(DEFAULT_SESSION_DURATION_SECS)
    }
}

/// Trimmed string value; empty strings count as absent.
pub fn string_field(data: &Map<String, Value>, key: &str) -> Option<String> {
    match data.get(key)? {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Seconds, given either as a number or a numeric string.
pub fn duration_field(data: &Map<String, Value>, key: &str) -> Result<Option<u64>, IntegrationError> {
    match data.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| IntegrationError::MetadataInvalid(format!("{key} must be a positive integer"))),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| IntegrationError::MetadataInvalid(format!("{key} must be a number of seconds"))),
        Some(_) => Err(IntegrationError::MetadataInvalid(format!("{key} must be a number of seconds"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metadata_requires_role_and_region() {
        let data = json!({ "region": "us-east-1" }).as_object().cloned().unwrap();
        let err = AwsMetadata::from_provider_data(&data, "s").unwrap_err();
        assert!(matches!(err, IntegrationError::MetadataMissing(k) if k == "role_arn"));
    }

    #[test]
    fn metadata_defaults_session_name_and_parses_duration() {
        let data = json!({
            "role_arn": " arn:aws:iam::123456789012:role/audit ",
            "region": "eu-west-1",
            "session_duration": "900"
        })
        .as_object()
        .cloned()
        .unwrap();
        let meta = AwsMetadata::from_provider_data(&data, "openlane-securityhub").unwrap();
        assert_eq!(meta.role_arn, "arn:aws:iam::123456789012:role/audit");
        assert_eq!(meta.session_name, "openlane-securityhub");
        assert_eq!(meta.session_duration_secs(), 900);
    }
}
