use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::config_decode::normalize_key;
use super::IntegrationError;
use crate::store::SsoAuthorizations;

/// Stable identifier of an integration, e.g. `aws_security_hub`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ProviderType(String);

impl ProviderType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ProviderType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthType {
    #[serde(rename = "oauth2")]
    OAuth2,
    #[serde(rename = "api_token")]
    ApiToken,
    #[serde(rename = "aws_federation")]
    AwsFederation,
    #[serde(rename = "oidc")]
    Oidc,
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuthType::OAuth2 => "oauth2",
            AuthType::ApiToken => "api_token",
            AuthType::AwsFederation => "aws_federation",
            AuthType::Oidc => "oidc",
        };
        f.write_str(s)
    }
}

// ── Provider specs ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthSpec {
    pub authorize_url: String,
    pub token_url: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Name of the environment variable holding the client id.
    pub client_id_ref: String,
    pub client_secret_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfoSpec {
    pub url: String,
}

/// Declarative provider description, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub name: ProviderType,
    pub auth_type: AuthType,
    #[serde(default)]
    pub oauth: Option<OAuthSpec>,
    #[serde(default)]
    pub userinfo: Option<UserInfoSpec>,
    #[serde(default)]
    pub credentials_schema: Value,
    #[serde(default)]
    pub capabilities: Option<ProviderCapabilities>,
    /// Overrides the provider's default API host.
    #[serde(default)]
    pub api_base_url: Option<String>,
}

impl ProviderSpec {
    pub fn has_credentials_schema(&self) -> bool {
        match &self.credentials_schema {
            Value::Object(map) => !map.is_empty(),
            _ => false,
        }
    }

    /// Declared capabilities, or the defaults derived from the spec.
    pub fn effective_capabilities(&self) -> ProviderCapabilities {
        self.capabilities.unwrap_or(ProviderCapabilities {
            supports_refresh_tokens: false,
            supports_client_pooling: false,
            supports_metadata_form: self.has_credentials_schema(),
        })
    }
}

/// Top-level shape of the provider spec file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderSpecFile {
    #[serde(default)]
    pub providers: Vec<ProviderSpec>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    #[serde(default)]
    pub supports_refresh_tokens: bool,
    #[serde(default)]
    pub supports_client_pooling: bool,
    #[serde(default)]
    pub supports_metadata_form: bool,
}

// ── Credentials ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    OauthToken,
    ApiToken,
    AwsFederation,
    Metadata,
}

impl CredentialKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialKind::OauthToken => "oauth_token",
            CredentialKind::ApiToken => "api_token",
            CredentialKind::AwsFederation => "aws_federation",
            CredentialKind::Metadata => "metadata",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "oauth_token" => Some(CredentialKind::OauthToken),
            "api_token" => Some(CredentialKind::ApiToken),
            "aws_federation" => Some(CredentialKind::AwsFederation),
            "metadata" => Some(CredentialKind::Metadata),
            _ => None,
        }
    }
}

#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct OAuthToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl OAuthToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|exp| exp <= now).unwrap_or(false)
    }
}

impl fmt::Debug for OAuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthToken")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_at", &self.expires_at)
            .field("token_type", &self.token_type)
            .field("scopes", &self.scopes)
            .finish()
    }
}

#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CredentialSet {
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default)]
    pub provider_data: Map<String, Value>,
}

impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSet")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &self.secret_access_key.as_ref().map(|_| "[REDACTED]"))
            .field("session_token", &self.session_token.as_ref().map(|_| "[REDACTED]"))
            .field("provider_data", &self.provider_data)
            .finish()
    }
}

/// Decrypted, normalized credential as handed to providers and operations.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialPayload {
    pub provider_type: ProviderType,
    pub kind: CredentialKind,
    #[serde(default)]
    pub oauth_token: Option<OAuthToken>,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default)]
    pub credential_set: Option<CredentialSet>,
    #[serde(default)]
    pub sso_authorizations: SsoAuthorizations,
}

impl CredentialPayload {
    pub fn new(provider_type: ProviderType, kind: CredentialKind) -> Self {
        Self {
            provider_type,
            kind,
            oauth_token: None,
            api_token: None,
            credential_set: None,
            sso_authorizations: SsoAuthorizations::new(),
        }
    }

    /// Anything but a metadata payload must carry a secret.
    pub fn validate(&self) -> Result<(), IntegrationError> {
        if self.kind == CredentialKind::Metadata {
            return Ok(());
        }
        if self.oauth_token.is_none() && self.api_token.is_none() && self.credential_set.is_none() {
            return Err(IntegrationError::MetadataMissing(format!(
                "{} credential carries no secret",
                self.kind.as_str()
            )));
        }
        Ok(())
    }

    pub fn provider_data(&self) -> Option<&Map<String, Value>> {
        self.credential_set.as_ref().map(|s| &s.provider_data)
    }
}

impl fmt::Debug for CredentialPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPayload")
            .field("provider_type", &self.provider_type)
            .field("kind", &self.kind)
            .field("oauth_token", &self.oauth_token)
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .field("credential_set", &self.credential_set)
            .finish()
    }
}

/// Raw inputs collected by an auth flow, before a provider normalizes them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubjectInputs {
    #[serde(default)]
    pub provider_data: Map<String, Value>,
    #[serde(default)]
    pub oauth_token: Option<OAuthToken>,
    #[serde(default, skip_serializing)]
    pub api_token: Option<String>,
}

/// Who owns a credential, plus what they submitted.
#[derive(Debug, Clone)]
pub struct CredentialSubject {
    pub tenant_id: String,
    pub subject_id: String,
    pub provider_type: ProviderType,
    pub display_name: String,
    pub credential_id: String,
    pub inputs: SubjectInputs,
}

// ── Auth flow ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AuthContext {
    pub tenant_id: String,
    pub subject_id: String,
    pub redirect_uri: String,
    /// Extra scopes on top of the spec's defaults.
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthSession {
    pub provider_type: ProviderType,
    pub state: String,
    pub authorize_url: String,
}

// ── Operations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Health,
    CollectFindings,
    Mutate,
    Query,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Ok,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub status: OperationStatus,
    pub summary: String,
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl OperationResult {
    pub fn ok(summary: impl Into<String>, details: Map<String, Value>) -> Self {
        Self {
            status: OperationStatus::Ok,
            summary: summary.into(),
            details,
        }
    }

    pub fn failed(summary: impl Into<String>, error: impl fmt::Display) -> Self {
        let mut details = Map::new();
        details.insert("error".into(), Value::String(error.to_string()));
        Self {
            status: OperationStatus::Failed,
            summary: summary.into(),
            details,
        }
    }

    pub fn skipped(summary: impl Into<String>) -> Self {
        Self {
            status: OperationStatus::Skipped,
            summary: summary.into(),
            details: Map::new(),
        }
    }
}

/// Stored preset for one operation. Callers may only override keys in
/// `allowed_overrides`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationTemplate {
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub allowed_overrides: BTreeSet<String>,
}

impl OperationTemplate {
    /// Merges overrides over the base config. Rejects the whole call when
    /// any key is outside the allow-list.
    pub fn apply(&self, overrides: &Map<String, Value>) -> Result<Map<String, Value>, IntegrationError> {
        if overrides.is_empty() {
            return Ok(self.config.clone());
        }
        if self.allowed_overrides.is_empty() {
            return Err(IntegrationError::OperationTemplateOverridesNotAllowed);
        }
        let allowed: BTreeSet<String> = self.allowed_overrides.iter().map(|k| normalize_key(k)).collect();
        for key in overrides.keys() {
            if !allowed.contains(&normalize_key(key)) {
                return Err(IntegrationError::OperationTemplateOverrideNotAllowed(key.clone()));
            }
        }
        let mut merged = self.config.clone();
        for (k, v) in overrides {
            let wanted = normalize_key(k);
            merged.retain(|base, _| normalize_key(base) != wanted);
            merged.insert(k.clone(), v.clone());
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn capabilities_default_from_schema() {
        let spec: ProviderSpec = serde_json::from_value(json!({
            "name": "github",
            "auth_type": "oauth2",
            "credentials_schema": { "type": "object", "properties": { "org": { "type": "string" } } }
        }))
        .unwrap();
        let caps = spec.effective_capabilities();
        assert!(!caps.supports_refresh_tokens);
        assert!(!caps.supports_client_pooling);
        assert!(caps.supports_metadata_form);

        let bare: ProviderSpec =
            serde_json::from_value(json!({ "name": "x", "auth_type": "api_token" })).unwrap();
        assert!(!bare.effective_capabilities().supports_metadata_form);
    }

    #[test]
    fn template_without_overrides_returns_base() {
        let template = OperationTemplate {
            config: obj(json!({ "page_size": 100 })),
            allowed_overrides: BTreeSet::new(),
        };
        assert_eq!(template.apply(&Map::new()).unwrap(), obj(json!({ "page_size": 100 })));
    }

    #[test]
    fn template_with_empty_allow_list_rejects_overrides() {
        let template = OperationTemplate {
            config: obj(json!({ "page_size": 100 })),
            allowed_overrides: BTreeSet::new(),
        };
        let err = template.apply(&obj(json!({ "severity": "high" }))).unwrap_err();
        assert!(matches!(err, IntegrationError::OperationTemplateOverridesNotAllowed));
    }

    #[test]
    fn template_rejects_key_outside_allow_list() {
        let template = OperationTemplate {
            config: obj(json!({ "page_size": 100 })),
            allowed_overrides: ["severity".to_string()].into_iter().collect(),
        };
        let err = template
            .apply(&obj(json!({ "severity": "high", "page_size": 5 })))
            .unwrap_err();
        assert!(matches!(err, IntegrationError::OperationTemplateOverrideNotAllowed(k) if k == "page_size"));
    }

    #[test]
    fn template_matches_override_keys_loosely() {
        let template = OperationTemplate {
            config: obj(json!({ "page_size": 100, "max_findings": 10 })),
            allowed_overrides: ["max_findings".to_string()].into_iter().collect(),
        };
        let merged = template.apply(&obj(json!({ "maxFindings": 250 }))).unwrap();
        assert_eq!(merged, obj(json!({ "page_size": 100, "maxFindings": 250 })));

        let err = template.apply(&obj(json!({ "pageSize": 5 }))).unwrap_err();
        assert!(matches!(err, IntegrationError::OperationTemplateOverrideNotAllowed(k) if k == "pageSize"));
    }

    #[test]
    fn payload_requires_secret_unless_metadata() {
        let payload = CredentialPayload::new("github".into(), CredentialKind::OauthToken);
        assert!(payload.validate().is_err());
        let meta = CredentialPayload::new("github".into(), CredentialKind::Metadata);
        assert!(meta.validate().is_ok());
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let mut payload = CredentialPayload::new("x".into(), CredentialKind::ApiToken);
        payload.api_token = Some("super-secret".into());
        assert!(!format!("{:?}", payload).contains("super-secret"));
    }
}
