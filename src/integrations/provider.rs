//! Provider variants and their builders.

use std::sync::Arc;

use chrono::Utc;
use jsonschema::JSONSchema;
use serde::Serialize;
use serde_json::{Map, Value};

use super::aws::{self, AwsMetadata};
use super::oauth::{self, OAuthClient, SecretResolver};
use super::operations::{
    sanitize_clients, sanitize_operations, ClientDescriptor, OperationDescriptor, OperationSummary,
};
use super::types::{
    AuthContext, AuthSession, AuthType, CredentialKind, CredentialPayload, CredentialSet,
    CredentialSubject, ProviderCapabilities, ProviderSpec, ProviderType, SubjectInputs, UserInfoSpec,
};
use super::IntegrationError;

/// State every provider variant carries.
#[derive(Clone)]
pub struct ProviderCore {
    provider_type: ProviderType,
    capabilities: ProviderCapabilities,
    operations: Vec<OperationDescriptor>,
    clients: Vec<ClientDescriptor>,
    credentials_schema: Option<Arc<JSONSchema>>,
}

impl ProviderCore {
    fn from_spec(
        spec: &ProviderSpec,
        operations: Vec<OperationDescriptor>,
        clients: Vec<ClientDescriptor>,
    ) -> Result<Self, IntegrationError> {
        let credentials_schema = if spec.has_credentials_schema() {
            let compiled = JSONSchema::compile(&spec.credentials_schema).map_err(|e| {
                IntegrationError::Builder(format!("{}: invalid credentials_schema: {}", spec.name, e))
            })?;
            Some(Arc::new(compiled))
        } else {
            None
        };

        Ok(Self {
            provider_type: spec.name.clone(),
            capabilities: spec.effective_capabilities(),
            operations: sanitize_operations(&spec.name, operations),
            clients: sanitize_clients(&spec.name, clients),
            credentials_schema,
        })
    }

    fn validate_metadata(&self, data: &Map<String, Value>) -> Result<(), IntegrationError> {
        let Some(schema) = &self.credentials_schema else {
            return Ok(());
        };
        let instance = Value::Object(data.clone());
        let result = schema.validate(&instance);
        if let Err(errors) = result {
            let messages: Vec<String> = errors.map(|e| e.to_string()).collect();
            return Err(IntegrationError::MetadataInvalid(messages.join("; ")));
        }
        Ok(())
    }
}

/// Closed set of provider shapes. The runner and API dispatch on the variant.
#[derive(Clone)]
pub enum Provider {
    OAuth {
        core: ProviderCore,
        oauth: OAuthClient,
    },
    ApiToken {
        core: ProviderCore,
    },
    AwsFederation {
        core: ProviderCore,
        default_session: String,
    },
    Oidc {
        core: ProviderCore,
        oauth: OAuthClient,
        userinfo: Option<UserInfoSpec>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderSummary {
    pub provider_type: ProviderType,
    pub auth_type: AuthType,
    pub capabilities: ProviderCapabilities,
    pub operations: Vec<OperationSummary>,
}

impl Provider {
    fn core(&self) -> &ProviderCore {
        match self {
            Provider::OAuth { core, .. }
            | Provider::ApiToken { core }
            | Provider::AwsFederation { core, .. }
            | Provider::Oidc { core, .. } => core,
        }
    }

    pub fn provider_type(&self) -> &ProviderType {
        &self.core().provider_type
    }

    pub fn auth_type(&self) -> AuthType {
        match self {
            Provider::OAuth { .. } => AuthType::OAuth2,
            Provider::ApiToken { .. } => AuthType::ApiToken,
            Provider::AwsFederation { .. } => AuthType::AwsFederation,
            Provider::Oidc { .. } => AuthType::Oidc,
        }
    }

    pub fn capabilities(&self) -> ProviderCapabilities {
        self.core().capabilities
    }

    pub fn operations(&self) -> &[OperationDescriptor] {
        &self.core().operations
    }

    pub fn client_descriptors(&self) -> &[ClientDescriptor] {
        &self.core().clients
    }

    pub fn operation(&self, name: &str) -> Option<&OperationDescriptor> {
        self.operations().iter().find(|op| op.name == name)
    }

    pub fn client(&self, name: &str) -> Option<&ClientDescriptor> {
        self.client_descriptors().iter().find(|c| c.name == name)
    }

    pub fn summary(&self) -> ProviderSummary {
        ProviderSummary {
            provider_type: self.provider_type().clone(),
            auth_type: self.auth_type(),
            capabilities: self.capabilities(),
            operations: self.operations().iter().map(OperationDescriptor::summary).collect(),
        }
    }

    pub fn begin_auth(&self, ctx: &AuthContext) -> Result<AuthSession, IntegrationError> {
        match self {
            Provider::OAuth { oauth, .. } | Provider::Oidc { oauth, .. } => {
                oauth.begin_auth(self.provider_type(), ctx)
            }
            _ => Err(IntegrationError::BeginAuthNotSupported(self.provider_type().clone())),
        }
    }

    /// Exchanges an authorization code for subject inputs. OIDC providers
    /// also pull the userinfo document into `provider_data`.
    pub async fn complete_auth(
        &self,
        http: &reqwest::Client,
        code: &str,
        redirect_uri: &str,
    ) -> Result<SubjectInputs, IntegrationError> {
        match self {
            Provider::OAuth { oauth, .. } => {
                let token = oauth.exchange_code(http, code, redirect_uri).await?;
                Ok(SubjectInputs {
                    oauth_token: Some(token),
                    ..Default::default()
                })
            }
            Provider::Oidc { oauth, userinfo, .. } => {
                let token = oauth.exchange_code(http, code, redirect_uri).await?;
                let provider_data = match userinfo {
                    Some(info) => oauth::fetch_userinfo(http, &info.url, &token).await?,
                    None => Map::new(),
                };
                Ok(SubjectInputs {
                    provider_data,
                    oauth_token: Some(token),
                    api_token: None,
                })
            }
            _ => Err(IntegrationError::BeginAuthNotSupported(self.provider_type().clone())),
        }
    }

    /// Validates the subject's inputs and produces a normalized payload.
    pub async fn mint(
        &self,
        http: &reqwest::Client,
        subject: &CredentialSubject,
    ) -> Result<CredentialPayload, IntegrationError> {
        let core = self.core();
        let inputs = &subject.inputs;
        let payload = match self {
            Provider::OAuth { oauth, .. } | Provider::Oidc { oauth, .. } => {
                let mut token = inputs.oauth_token.clone().ok_or(IntegrationError::OAuthTokenMissing)?;
                if token.access_token.trim().is_empty() {
                    return Err(IntegrationError::AccessTokenEmpty);
                }
                if token.is_expired(Utc::now()) && core.capabilities.supports_refresh_tokens {
                    if let Some(refresh) = token.refresh_token.clone() {
                        tracing::info!(
                            tenant_id = %subject.tenant_id,
                            provider = %core.provider_type,
                            "refreshing expired oauth token during mint"
                        );
                        token = oauth.refresh(http, &refresh).await?;
                    }
                }
                core.validate_metadata(&inputs.provider_data)?;

                let mut payload = CredentialPayload::new(core.provider_type.clone(), CredentialKind::OauthToken);
                payload.oauth_token = Some(token);
                if !inputs.provider_data.is_empty() {
                    payload.credential_set = Some(CredentialSet {
                        provider_data: inputs.provider_data.clone(),
                        ..Default::default()
                    });
                }
                payload
            }
            Provider::ApiToken { .. } => {
                let token = inputs
                    .api_token
                    .as_deref()
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .ok_or(IntegrationError::ApiTokenMissing)?;
                core.validate_metadata(&inputs.provider_data)?;

                let mut payload = CredentialPayload::new(core.provider_type.clone(), CredentialKind::ApiToken);
                payload.api_token = Some(token.to_string());
                if !inputs.provider_data.is_empty() {
                    payload.credential_set = Some(CredentialSet {
                        provider_data: inputs.provider_data.clone(),
                        ..Default::default()
                    });
                }
                payload
            }
            Provider::AwsFederation { default_session, .. } => {
                if inputs.provider_data.is_empty() {
                    return Err(IntegrationError::MetadataMissing("provider_data".into()));
                }
                let meta = AwsMetadata::from_provider_data(&inputs.provider_data, default_session)?;
                let cleaned = clean_aws_provider_data(&inputs.provider_data, &meta);
                core.validate_metadata(&cleaned)?;

                let secret = |key: &str| aws::string_field(&inputs.provider_data, key);
                let mut payload =
                    CredentialPayload::new(core.provider_type.clone(), CredentialKind::AwsFederation);
                payload.credential_set = Some(CredentialSet {
                    access_key_id: secret("access_key_id"),
                    secret_access_key: secret("secret_access_key"),
                    session_token: secret("session_token"),
                    provider_data: cleaned,
                });
                payload
            }
        };
        payload.validate()?;
        Ok(payload)
    }
}

/// Known metadata keys only, trimmed, with the session defaults filled in.
/// Base-credential keys never survive into `provider_data`.
fn clean_aws_provider_data(raw: &Map<String, Value>, meta: &AwsMetadata) -> Map<String, Value> {
    let mut out = Map::new();
    for key in aws::METADATA_KEYS {
        if let Some(v) = aws::string_field(raw, key) {
            out.insert((*key).to_string(), Value::String(v));
        }
    }
    out.insert("session_name".into(), Value::String(meta.session_name.clone()));
    out.insert(
        "session_duration".into(),
        Value::from(meta.session_duration_secs()),
    );
    out
}

// ── Builders ───────────────────────────────────────────────────

/// Inputs shared by every builder.
#[derive(Clone)]
pub struct BuildContext {
    pub secrets: SecretResolver,
}

impl Default for BuildContext {
    fn default() -> Self {
        Self {
            secrets: oauth::env_secrets(),
        }
    }
}

pub trait ProviderBuilder: Send + Sync {
    fn auth_type(&self) -> AuthType;

    /// `Ok(None)` means the spec is incomplete for this builder and the
    /// catalog should skip it.
    fn build(&self, ctx: &BuildContext, spec: &ProviderSpec) -> Result<Option<Provider>, IntegrationError>;
}

fn check_auth_type(expected: AuthType, spec: &ProviderSpec) -> Result<(), IntegrationError> {
    if spec.auth_type != expected {
        return Err(IntegrationError::AuthTypeMismatch {
            expected,
            actual: spec.auth_type,
        });
    }
    Ok(())
}

/// Builds OAuth 2.0 or OIDC providers.
#[derive(Clone, Default)]
pub struct OAuthBuilder {
    oidc: bool,
    operations: Vec<OperationDescriptor>,
    clients: Vec<ClientDescriptor>,
}

impl OAuthBuilder {
    pub fn oauth2() -> Self {
        Self::default()
    }

    pub fn oidc() -> Self {
        Self {
            oidc: true,
            ..Self::default()
        }
    }

    pub fn with_operations(mut self, operations: Vec<OperationDescriptor>) -> Self {
        self.operations = operations;
        self
    }

    pub fn with_clients(mut self, clients: Vec<ClientDescriptor>) -> Self {
        self.clients = clients;
        self
    }
}

impl ProviderBuilder for OAuthBuilder {
    fn auth_type(&self) -> AuthType {
        if self.oidc {
            AuthType::Oidc
        } else {
            AuthType::OAuth2
        }
    }

    fn build(&self, ctx: &BuildContext, spec: &ProviderSpec) -> Result<Option<Provider>, IntegrationError> {
        check_auth_type(self.auth_type(), spec)?;
        let Some(oauth_spec) = &spec.oauth else {
            return Ok(None);
        };
        let oauth = OAuthClient::from_spec(oauth_spec, &ctx.secrets)?;
        let core = ProviderCore::from_spec(spec, self.operations.clone(), self.clients.clone())?;
        Ok(Some(if self.oidc {
            Provider::Oidc {
                core,
                oauth,
                userinfo: spec.userinfo.clone(),
            }
        } else {
            Provider::OAuth { core, oauth }
        }))
    }
}

#[derive(Clone, Default)]
pub struct ApiTokenBuilder {
    operations: Vec<OperationDescriptor>,
    clients: Vec<ClientDescriptor>,
}

impl ApiTokenBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_operations(mut self, operations: Vec<OperationDescriptor>) -> Self {
        self.operations = operations;
        self
    }

    pub fn with_clients(mut self, clients: Vec<ClientDescriptor>) -> Self {
        self.clients = clients;
        self
    }
}

impl ProviderBuilder for ApiTokenBuilder {
    fn auth_type(&self) -> AuthType {
        AuthType::ApiToken
    }

    fn build(&self, _ctx: &BuildContext, spec: &ProviderSpec) -> Result<Option<Provider>, IntegrationError> {
        check_auth_type(AuthType::ApiToken, spec)?;
        let core = ProviderCore::from_spec(spec, self.operations.clone(), self.clients.clone())?;
        Ok(Some(Provider::ApiToken { core }))
    }
}

#[derive(Clone)]
pub struct AwsFederationBuilder {
    default_session: String,
    operations: Vec<OperationDescriptor>,
    clients: Vec<ClientDescriptor>,
}

impl AwsFederationBuilder {
    pub fn new(default_session: impl Into<String>) -> Self {
        Self {
            default_session: default_session.into(),
            operations: Vec::new(),
            clients: Vec::new(),
        }
    }

    pub fn with_operations(mut self, operations: Vec<OperationDescriptor>) -> Self {
        self.operations = operations;
        self
    }

    pub fn with_clients(mut self, clients: Vec<ClientDescriptor>) -> Self {
        self.clients = clients;
        self
    }
}

impl ProviderBuilder for AwsFederationBuilder {
    fn auth_type(&self) -> AuthType {
        AuthType::AwsFederation
    }

    fn build(&self, _ctx: &BuildContext, spec: &ProviderSpec) -> Result<Option<Provider>, IntegrationError> {
        check_auth_type(AuthType::AwsFederation, spec)?;
        let core = ProviderCore::from_spec(spec, self.operations.clone(), self.clients.clone())?;
        Ok(Some(Provider::AwsFederation {
            core,
            default_session: self.default_session.clone(),
        }))
    }
}
