//! Persistence seams.
//!
//! Three narrow traits cover everything the core reads and writes:
//! [`IdentityStore`] for users, organizations and opaque tokens,
//! [`CredentialStore`] for integration credential rows, and
//! [`TemplateStore`] for operation presets. Both backends implement all of
//! them: [`postgres::PgStore`] in production and [`memory::MemoryStore`] for
//! tests and local runs.

pub mod memory;
pub mod postgres;
pub mod vault;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::CryptoError;
use crate::integrations::types::{OperationTemplate, ProviderType};

pub use vault::CredentialVault;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("stored value is malformed: {0}")]
    Malformed(String),

    #[error("{0} already exists")]
    AlreadyExists(String),
}

/// Tenant id → last time the token was authorized through the tenant's IdP.
pub type SsoAuthorizations = BTreeMap<String, DateTime<Utc>>;

// ── Identity rows ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub email: String,
    pub display_name: String,
    pub is_system_admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizationRecord {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrgRole {
    Owner,
    Admin,
    Member,
}

impl OrgRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrgRole::Owner => "owner",
            OrgRole::Admin => "admin",
            OrgRole::Member => "member",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(OrgRole::Owner),
            "admin" => Some(OrgRole::Admin),
            "member" => Some(OrgRole::Member),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantSsoPolicy {
    pub identity_provider_login_enforced: bool,
}

/// A personal access token row. The plaintext token is never stored: rows
/// are indexed by `token_hash` and keep an encrypted copy for the
/// constant-time confirmation step.
#[derive(Debug, Clone)]
pub struct PersonalAccessTokenRecord {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub token_hash: String,
    pub encrypted_token: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub organization_ids: Vec<String>,
    pub sso_authorizations: SsoAuthorizations,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// A service credential owned by one organization.
#[derive(Debug, Clone)]
pub struct ApiTokenRecord {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub token_hash: String,
    pub encrypted_token: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
    pub sso_authorizations: SsoAuthorizations,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Who a token belongs to, for ownership checks by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenOwner {
    Personal {
        user_id: String,
        organization_ids: Vec<String>,
    },
    Service {
        organization_id: String,
    },
}

// ── Integration credential rows ────────────────────────────────

/// Row form of a credential payload. Secret columns hold envelope
/// ciphertext; everything else is plaintext metadata.
#[derive(Debug, Clone, Default)]
pub struct StoredCredential {
    pub id: String,
    pub tenant_id: String,
    pub provider_type: String,
    pub kind: String,
    pub oauth_access_token: Option<String>,
    pub oauth_refresh_token: Option<String>,
    pub oauth_expires_at: Option<DateTime<Utc>>,
    pub oauth_token_type: Option<String>,
    pub oauth_scopes: Vec<String>,
    pub api_token: Option<String>,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub aws_session_token: Option<String>,
    pub provider_data: serde_json::Value,
    pub sso_authorizations: SsoAuthorizations,
    pub created_at: DateTime<Utc>,
}

// ── Traits ─────────────────────────────────────────────────────

/// Reads used by the authentication path. Lookups bypass any tenant
/// row-level filtering; the caller has not been authenticated yet.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn find_user(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError>;

    async fn find_organization(
        &self,
        organization_id: &str,
    ) -> Result<Option<OrganizationRecord>, StoreError>;

    async fn membership_role(
        &self,
        user_id: &str,
        organization_id: &str,
    ) -> Result<Option<OrgRole>, StoreError>;

    async fn sso_policy(&self, tenant_id: &str) -> Result<Option<TenantSsoPolicy>, StoreError>;

    async fn find_personal_access_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<PersonalAccessTokenRecord>, StoreError>;

    async fn find_api_token(&self, token_hash: &str) -> Result<Option<ApiTokenRecord>, StoreError>;

    async fn token_owner(&self, token_id: &str) -> Result<Option<TokenOwner>, StoreError>;

    async fn insert_personal_access_token(
        &self,
        record: PersonalAccessTokenRecord,
    ) -> Result<(), StoreError>;

    async fn insert_api_token(&self, record: ApiTokenRecord) -> Result<(), StoreError>;
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Newest credential row for the tenant and provider.
    async fn latest_credential(
        &self,
        tenant_id: &str,
        provider_type: &str,
    ) -> Result<Option<StoredCredential>, StoreError>;

    /// Appends a row. Credential rows are immutable once written.
    async fn insert_credential(&self, row: StoredCredential) -> Result<(), StoreError>;

    async fn delete_credentials(&self, tenant_id: &str, provider_type: &str)
        -> Result<u64, StoreError>;

    /// Merges `tenant_id → now` into the token's SSO authorizations. Works
    /// for both personal access tokens and API tokens.
    async fn record_sso_authorization(
        &self,
        token_id: &str,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn mark_last_used(&self, token_id: &str, now: DateTime<Utc>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn get_template(
        &self,
        tenant_id: &str,
        provider_type: &ProviderType,
        operation: &str,
    ) -> Result<Option<OperationTemplate>, StoreError>;

    async fn put_template(
        &self,
        tenant_id: &str,
        provider_type: &ProviderType,
        operation: &str,
        template: OperationTemplate,
    ) -> Result<(), StoreError>;
}
