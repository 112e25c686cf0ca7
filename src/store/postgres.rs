use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;

use super::{
    ApiTokenRecord, CredentialStore, IdentityStore, OrgRole, OrganizationRecord,
    PersonalAccessTokenRecord, SsoAuthorizations, StoreError, StoredCredential, TemplateStore,
    TenantSsoPolicy, TokenOwner, UserRecord,
};
use crate::crypto::migration::{ColumnRow, ColumnSource};
use crate::integrations::types::{OperationTemplate, ProviderType};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn sealed_column(&self, column: SealedColumn) -> PgSealedColumn {
        PgSealedColumn {
            pool: self.pool.clone(),
            column,
        }
    }
}

#[async_trait]
impl IdentityStore for PgStore {
    async fn find_user(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, email, display_name, is_system_admin FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn find_organization(
        &self,
        organization_id: &str,
    ) -> Result<Option<OrganizationRecord>, StoreError> {
        let row = sqlx::query_as::<_, (String, String)>(
            "SELECT id, name FROM organizations WHERE id = $1",
        )
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id, name)| OrganizationRecord { id, name }))
    }

    async fn membership_role(
        &self,
        user_id: &str,
        organization_id: &str,
    ) -> Result<Option<OrgRole>, StoreError> {
        let role = sqlx::query_scalar::<_, String>(
            "SELECT role FROM org_memberships WHERE user_id = $1 AND organization_id = $2",
        )
        .bind(user_id)
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(role.as_deref().and_then(OrgRole::parse))
    }

    async fn sso_policy(&self, tenant_id: &str) -> Result<Option<TenantSsoPolicy>, StoreError> {
        let enforced = sqlx::query_scalar::<_, bool>(
            "SELECT identity_provider_login_enforced FROM organization_settings WHERE organization_id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(enforced.map(|identity_provider_login_enforced| TenantSsoPolicy {
            identity_provider_login_enforced,
        }))
    }

    async fn find_personal_access_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<PersonalAccessTokenRecord>, StoreError> {
        let row = sqlx::query_as::<_, PatRow>(
            r#"SELECT p.id, p.owner_id, p.name, p.token_hash, p.encrypted_token, p.expires_at,
                      p.sso_authorizations, p.last_used_at,
                      COALESCE(array_agg(o.organization_id) FILTER (WHERE o.organization_id IS NOT NULL), '{}') AS organization_ids
               FROM personal_access_tokens p
               LEFT JOIN personal_access_token_organizations o ON o.token_id = p.id
               WHERE p.token_hash = $1
               GROUP BY p.id"#,
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn find_api_token(&self, token_hash: &str) -> Result<Option<ApiTokenRecord>, StoreError> {
        let row = sqlx::query_as::<_, ApiTokenRow>(
            r#"SELECT id, owner_id, name, token_hash, encrypted_token, expires_at, scopes,
                      sso_authorizations, last_used_at
               FROM api_tokens WHERE token_hash = $1"#,
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn token_owner(&self, token_id: &str) -> Result<Option<TokenOwner>, StoreError> {
        let pat: Option<(String, Vec<String>)> = sqlx::query_as(
            r#"SELECT p.owner_id,
                      COALESCE(array_agg(o.organization_id) FILTER (WHERE o.organization_id IS NOT NULL), '{}')
               FROM personal_access_tokens p
               LEFT JOIN personal_access_token_organizations o ON o.token_id = p.id
               WHERE p.id = $1
               GROUP BY p.id"#,
        )
        .bind(token_id)
        .fetch_optional(&self.pool)
        .await?;
        if let Some((user_id, organization_ids)) = pat {
            return Ok(Some(TokenOwner::Personal {
                user_id,
                organization_ids,
            }));
        }

        let api: Option<(String,)> = sqlx::query_as("SELECT owner_id FROM api_tokens WHERE id = $1")
            .bind(token_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(api.map(|(organization_id,)| TokenOwner::Service { organization_id }))
    }

    async fn insert_personal_access_token(
        &self,
        record: PersonalAccessTokenRecord,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"INSERT INTO personal_access_tokens (id, owner_id, name, token_hash, encrypted_token, expires_at, sso_authorizations)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(&record.id)
        .bind(&record.owner_id)
        .bind(&record.name)
        .bind(&record.token_hash)
        .bind(&record.encrypted_token)
        .bind(record.expires_at)
        .bind(Json(&record.sso_authorizations))
        .execute(&mut *tx)
        .await
        .map_err(|e| unique_violation(e, "personal access token"))?;

        for org in &record.organization_ids {
            sqlx::query(
                "INSERT INTO personal_access_token_organizations (token_id, organization_id) VALUES ($1, $2)",
            )
            .bind(&record.id)
            .bind(org)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_api_token(&self, record: ApiTokenRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO api_tokens (id, owner_id, name, token_hash, encrypted_token, expires_at, scopes, sso_authorizations)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
        )
        .bind(&record.id)
        .bind(&record.owner_id)
        .bind(&record.name)
        .bind(&record.token_hash)
        .bind(&record.encrypted_token)
        .bind(record.expires_at)
        .bind(&record.scopes)
        .bind(Json(&record.sso_authorizations))
        .execute(&self.pool)
        .await
        .map_err(|e| unique_violation(e, "api token"))?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for PgStore {
    async fn latest_credential(
        &self,
        tenant_id: &str,
        provider_type: &str,
    ) -> Result<Option<StoredCredential>, StoreError> {
        let row = sqlx::query_as::<_, CredentialRow>(
            r#"SELECT id, tenant_id, provider_type, kind, oauth_access_token, oauth_refresh_token,
                      oauth_expires_at, oauth_token_type, oauth_scopes, api_token, aws_access_key_id,
                      aws_secret_access_key, aws_session_token, provider_data, sso_authorizations, created_at
               FROM integration_credentials
               WHERE tenant_id = $1 AND provider_type = $2
               ORDER BY created_at DESC
               LIMIT 1"#,
        )
        .bind(tenant_id)
        .bind(provider_type)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn insert_credential(&self, row: StoredCredential) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO integration_credentials
                 (id, tenant_id, provider_type, kind, oauth_access_token, oauth_refresh_token,
                  oauth_expires_at, oauth_token_type, oauth_scopes, api_token, aws_access_key_id,
                  aws_secret_access_key, aws_session_token, provider_data, sso_authorizations, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)"#,
        )
        .bind(&row.id)
        .bind(&row.tenant_id)
        .bind(&row.provider_type)
        .bind(&row.kind)
        .bind(&row.oauth_access_token)
        .bind(&row.oauth_refresh_token)
        .bind(row.oauth_expires_at)
        .bind(&row.oauth_token_type)
        .bind(&row.oauth_scopes)
        .bind(&row.api_token)
        .bind(&row.aws_access_key_id)
        .bind(&row.aws_secret_access_key)
        .bind(&row.aws_session_token)
        .bind(Json(&row.provider_data))
        .bind(Json(&row.sso_authorizations))
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_credentials(
        &self,
        tenant_id: &str,
        provider_type: &str,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM integration_credentials WHERE tenant_id = $1 AND provider_type = $2",
        )
        .bind(tenant_id)
        .bind(provider_type)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn record_sso_authorization(
        &self,
        token_id: &str,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        for table in ["personal_access_tokens", "api_tokens"] {
            let sql = format!(
                "UPDATE {} SET sso_authorizations = sso_authorizations || jsonb_build_object($2::text, to_jsonb($3::timestamptz)) WHERE id = $1",
                table
            );
            let result = sqlx::query(&sql)
                .bind(token_id)
                .bind(tenant_id)
                .bind(now)
                .execute(&self.pool)
                .await?;
            if result.rows_affected() > 0 {
                return Ok(());
            }
        }
        Err(StoreError::NotFound)
    }

    async fn mark_last_used(&self, token_id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        for table in ["personal_access_tokens", "api_tokens"] {
            let sql = format!("UPDATE {} SET last_used_at = $2 WHERE id = $1", table);
            let result = sqlx::query(&sql)
                .bind(token_id)
                .bind(now)
                .execute(&self.pool)
                .await?;
            if result.rows_affected() > 0 {
                return Ok(());
            }
        }
        Err(StoreError::NotFound)
    }
}

#[async_trait]
impl TemplateStore for PgStore {
    async fn get_template(
        &self,
        tenant_id: &str,
        provider_type: &ProviderType,
        operation: &str,
    ) -> Result<Option<OperationTemplate>, StoreError> {
        let row = sqlx::query_as::<_, (Json<serde_json::Map<String, serde_json::Value>>, Vec<String>)>(
            r#"SELECT config, allowed_overrides FROM operation_templates
               WHERE tenant_id = $1 AND provider_type = $2 AND operation = $3"#,
        )
        .bind(tenant_id)
        .bind(provider_type.as_str())
        .bind(operation)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(config, allowed)| OperationTemplate {
            config: config.0,
            allowed_overrides: allowed.into_iter().collect(),
        }))
    }

    async fn put_template(
        &self,
        tenant_id: &str,
        provider_type: &ProviderType,
        operation: &str,
        template: OperationTemplate,
    ) -> Result<(), StoreError> {
        let allowed: Vec<String> = template.allowed_overrides.into_iter().collect();
        sqlx::query(
            r#"INSERT INTO operation_templates (tenant_id, provider_type, operation, config, allowed_overrides)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (tenant_id, provider_type, operation)
               DO UPDATE SET config = EXCLUDED.config,
                             allowed_overrides = EXCLUDED.allowed_overrides,
                             updated_at = NOW()"#,
        )
        .bind(tenant_id)
        .bind(provider_type.as_str())
        .bind(operation)
        .bind(Json(&template.config))
        .bind(&allowed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn unique_violation(e: sqlx::Error, what: &str) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::AlreadyExists(what.to_string())
        }
        _ => StoreError::Database(e),
    }
}

// ── Sealed columns ─────────────────────────────────────────────

/// Columns that hold envelope ciphertext. The list is closed so table and
/// column names never come from user input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealedColumn {
    PersonalAccessTokenSecret,
    ApiTokenSecret,
    OAuthAccessToken,
    OAuthRefreshToken,
    IntegrationApiToken,
    AwsAccessKeyId,
    AwsSecretAccessKey,
    AwsSessionToken,
}

impl SealedColumn {
    pub const ALL: [SealedColumn; 8] = [
        SealedColumn::PersonalAccessTokenSecret,
        SealedColumn::ApiTokenSecret,
        SealedColumn::OAuthAccessToken,
        SealedColumn::OAuthRefreshToken,
        SealedColumn::IntegrationApiToken,
        SealedColumn::AwsAccessKeyId,
        SealedColumn::AwsSecretAccessKey,
        SealedColumn::AwsSessionToken,
    ];

    pub fn table(&self) -> &'static str {
        match self {
            SealedColumn::PersonalAccessTokenSecret => "personal_access_tokens",
            SealedColumn::ApiTokenSecret => "api_tokens",
            _ => "integration_credentials",
        }
    }

    pub fn column(&self) -> &'static str {
        match self {
            SealedColumn::PersonalAccessTokenSecret | SealedColumn::ApiTokenSecret => {
                "encrypted_token"
            }
            SealedColumn::OAuthAccessToken => "oauth_access_token",
            SealedColumn::OAuthRefreshToken => "oauth_refresh_token",
            SealedColumn::IntegrationApiToken => "api_token",
            SealedColumn::AwsAccessKeyId => "aws_access_key_id",
            SealedColumn::AwsSecretAccessKey => "aws_secret_access_key",
            SealedColumn::AwsSessionToken => "aws_session_token",
        }
    }

    pub fn parse(table: &str, column: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.table() == table && c.column() == column)
    }
}

pub struct PgSealedColumn {
    pool: PgPool,
    column: SealedColumn,
}

#[async_trait]
impl ColumnSource for PgSealedColumn {
    fn name(&self) -> String {
        format!("{}.{}", self.column.table(), self.column.column())
    }

    async fn fetch_batch(&self, after: Option<&str>, limit: usize) -> anyhow::Result<Vec<ColumnRow>> {
        let sql = format!(
            "SELECT id, {col} FROM {table} WHERE {col} IS NOT NULL AND ($1::text IS NULL OR id > $1) ORDER BY id LIMIT $2",
            col = self.column.column(),
            table = self.column.table(),
        );
        let rows = sqlx::query_as::<_, (String, String)>(&sql)
            .bind(after)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(id, value)| ColumnRow { id, value })
            .collect())
    }

    async fn write(&self, id: &str, value: &str) -> anyhow::Result<()> {
        let sql = format!(
            "UPDATE {table} SET {col} = $2 WHERE id = $1",
            col = self.column.column(),
            table = self.column.table(),
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ── Row types ──────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct UserRow {
    id: String,
    email: String,
    display_name: String,
    is_system_admin: bool,
}

impl From<UserRow> for UserRecord {
    fn from(r: UserRow) -> Self {
        UserRecord {
            id: r.id,
            email: r.email,
            display_name: r.display_name,
            is_system_admin: r.is_system_admin,
        }
    }
}

#[derive(sqlx::FromRow)]
struct PatRow {
    id: String,
    owner_id: String,
    name: String,
    token_hash: String,
    encrypted_token: String,
    expires_at: Option<DateTime<Utc>>,
    sso_authorizations: Json<SsoAuthorizations>,
    last_used_at: Option<DateTime<Utc>>,
    organization_ids: Vec<String>,
}

impl From<PatRow> for PersonalAccessTokenRecord {
    fn from(r: PatRow) -> Self {
        PersonalAccessTokenRecord {
            id: r.id,
            owner_id: r.owner_id,
            name: r.name,
            token_hash: r.token_hash,
            encrypted_token: r.encrypted_token,
            expires_at: r.expires_at,
            organization_ids: r.organization_ids,
            sso_authorizations: r.sso_authorizations.0,
            last_used_at: r.last_used_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ApiTokenRow {
    id: String,
    owner_id: String,
    name: String,
    token_hash: String,
    encrypted_token: String,
    expires_at: Option<DateTime<Utc>>,
    scopes: Vec<String>,
    sso_authorizations: Json<SsoAuthorizations>,
    last_used_at: Option<DateTime<Utc>>,
}

impl From<ApiTokenRow> for ApiTokenRecord {
    fn from(r: ApiTokenRow) -> Self {
        ApiTokenRecord {
            id: r.id,
            owner_id: r.owner_id,
            name: r.name,
            token_hash: r.token_hash,
            encrypted_token: r.encrypted_token,
            expires_at: r.expires_at,
            scopes: r.scopes,
            sso_authorizations: r.sso_authorizations.0,
            last_used_at: r.last_used_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct CredentialRow {
    id: String,
    tenant_id: String,
    provider_type: String,
    kind: String,
    oauth_access_token: Option<String>,
    oauth_refresh_token: Option<String>,
    oauth_expires_at: Option<DateTime<Utc>>,
    oauth_token_type: Option<String>,
    oauth_scopes: Vec<String>,
    api_token: Option<String>,
    aws_access_key_id: Option<String>,
    aws_secret_access_key: Option<String>,
    aws_session_token: Option<String>,
    provider_data: Json<serde_json::Value>,
    sso_authorizations: Json<SsoAuthorizations>,
    created_at: DateTime<Utc>,
}

impl From<CredentialRow> for StoredCredential {
    fn from(r: CredentialRow) -> Self {
        StoredCredential {
            id: r.id,
            tenant_id: r.tenant_id,
            provider_type: r.provider_type,
            kind: r.kind,
            oauth_access_token: r.oauth_access_token,
            oauth_refresh_token: r.oauth_refresh_token,
            oauth_expires_at: r.oauth_expires_at,
            oauth_token_type: r.oauth_token_type,
            oauth_scopes: r.oauth_scopes,
            api_token: r.api_token,
            aws_access_key_id: r.aws_access_key_id,
            aws_secret_access_key: r.aws_secret_access_key,
            aws_session_token: r.aws_session_token,
            provider_data: r.provider_data.0,
            sso_authorizations: r.sso_authorizations.0,
            created_at: r.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_columns_parse_only_known_pairs() {
        assert_eq!(
            SealedColumn::parse("personal_access_tokens", "encrypted_token"),
            Some(SealedColumn::PersonalAccessTokenSecret)
        );
        assert_eq!(
            SealedColumn::parse("integration_credentials", "aws_session_token"),
            Some(SealedColumn::AwsSessionToken)
        );
        assert_eq!(SealedColumn::parse("users", "email"), None);
        assert_eq!(SealedColumn::parse("api_tokens; DROP TABLE users", "encrypted_token"), None);
    }
}
