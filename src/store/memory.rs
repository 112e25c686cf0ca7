use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::{
    ApiTokenRecord, CredentialStore, IdentityStore, OrgRole, OrganizationRecord,
    PersonalAccessTokenRecord, StoreError, StoredCredential, TemplateStore, TenantSsoPolicy,
    TokenOwner, UserRecord,
};
use crate::integrations::types::{OperationTemplate, ProviderType};

/// In-process store backed by `DashMap`s. Used by the test suite and by
/// `serve --memory` for local development.
#[derive(Default)]
pub struct MemoryStore {
    users: DashMap<String, UserRecord>,
    organizations: DashMap<String, OrganizationRecord>,
    memberships: DashMap<(String, String), OrgRole>,
    sso_policies: DashMap<String, TenantSsoPolicy>,
    pats: DashMap<String, PersonalAccessTokenRecord>,
    api_tokens: DashMap<String, ApiTokenRecord>,
    credentials: DashMap<(String, String), Vec<StoredCredential>>,
    templates: DashMap<(String, String, String), OperationTemplate>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Seeding --

    pub fn insert_user(&self, user: UserRecord) {
        self.users.insert(user.id.clone(), user);
    }

    pub fn insert_organization(&self, org: OrganizationRecord) {
        self.organizations.insert(org.id.clone(), org);
    }

    pub fn add_membership(&self, user_id: &str, organization_id: &str, role: OrgRole) {
        self.memberships
            .insert((user_id.to_string(), organization_id.to_string()), role);
    }

    pub fn set_sso_policy(&self, tenant_id: &str, enforced: bool) {
        self.sso_policies.insert(
            tenant_id.to_string(),
            TenantSsoPolicy {
                identity_provider_login_enforced: enforced,
            },
        );
    }

    pub fn personal_access_token(&self, id: &str) -> Option<PersonalAccessTokenRecord> {
        self.pats.get(id).map(|r| r.clone())
    }

    pub fn api_token(&self, id: &str) -> Option<ApiTokenRecord> {
        self.api_tokens.get(id).map(|r| r.clone())
    }

    /// Mutates a stored PAT in place. Returns `None` when the id is unknown.
    pub fn update_personal_access_token<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut PersonalAccessTokenRecord) -> R,
    ) -> Option<R> {
        self.pats.get_mut(id).map(|mut r| f(&mut *r))
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn find_user(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.users.get(user_id).map(|r| r.clone()))
    }

    async fn find_organization(
        &self,
        organization_id: &str,
    ) -> Result<Option<OrganizationRecord>, StoreError> {
        Ok(self.organizations.get(organization_id).map(|r| r.clone()))
    }

    async fn membership_role(
        &self,
        user_id: &str,
        organization_id: &str,
    ) -> Result<Option<OrgRole>, StoreError> {
        Ok(self
            .memberships
            .get(&(user_id.to_string(), organization_id.to_string()))
            .map(|r| *r))
    }

    async fn sso_policy(&self, tenant_id: &str) -> Result<Option<TenantSsoPolicy>, StoreError> {
        Ok(self.sso_policies.get(tenant_id).map(|r| *r))
    }

    async fn find_personal_access_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<PersonalAccessTokenRecord>, StoreError> {
        Ok(self
            .pats
            .iter()
            .find(|r| r.token_hash == token_hash)
            .map(|r| r.clone()))
    }

    async fn find_api_token(&self, token_hash: &str) -> Result<Option<ApiTokenRecord>, StoreError> {
        Ok(self
            .api_tokens
            .iter()
            .find(|r| r.token_hash == token_hash)
            .map(|r| r.clone()))
    }

    async fn token_owner(&self, token_id: &str) -> Result<Option<TokenOwner>, StoreError> {
        if let Some(pat) = self.pats.get(token_id) {
            return Ok(Some(TokenOwner::Personal {
                user_id: pat.owner_id.clone(),
                organization_ids: pat.organization_ids.clone(),
            }));
        }
        Ok(self.api_tokens.get(token_id).map(|api| TokenOwner::Service {
            organization_id: api.owner_id.clone(),
        }))
    }

    async fn insert_personal_access_token(
        &self,
        record: PersonalAccessTokenRecord,
    ) -> Result<(), StoreError> {
        if self.pats.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(format!("token {}", record.id)));
        }
        self.pats.insert(record.id.clone(), record);
        Ok(())
    }

    async fn insert_api_token(&self, record: ApiTokenRecord) -> Result<(), StoreError> {
        if self.api_tokens.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(format!("token {}", record.id)));
        }
        self.api_tokens.insert(record.id.clone(), record);
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn latest_credential(
        &self,
        tenant_id: &str,
        provider_type: &str,
    ) -> Result<Option<StoredCredential>, StoreError> {
        Ok(self
            .credentials
            .get(&(tenant_id.to_string(), provider_type.to_string()))
            .and_then(|rows| rows.iter().max_by_key(|r| r.created_at).cloned()))
    }

    async fn insert_credential(&self, row: StoredCredential) -> Result<(), StoreError> {
        self.credentials
            .entry((row.tenant_id.clone(), row.provider_type.clone()))
            .or_default()
            .push(row);
        Ok(())
    }

    async fn delete_credentials(
        &self,
        tenant_id: &str,
        provider_type: &str,
    ) -> Result<u64, StoreError> {
        Ok(self
            .credentials
            .remove(&(tenant_id.to_string(), provider_type.to_string()))
            .map(|(_, rows)| rows.len() as u64)
            .unwrap_or(0))
    }

    async fn record_sso_authorization(
        &self,
        token_id: &str,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(mut pat) = self.pats.get_mut(token_id) {
            pat.sso_authorizations.insert(tenant_id.to_string(), now);
            return Ok(());
        }
        if let Some(mut api) = self.api_tokens.get_mut(token_id) {
            api.sso_authorizations.insert(tenant_id.to_string(), now);
            return Ok(());
        }
        Err(StoreError::NotFound)
    }

    async fn mark_last_used(&self, token_id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(mut pat) = self.pats.get_mut(token_id) {
            pat.last_used_at = Some(now);
            return Ok(());
        }
        if let Some(mut api) = self.api_tokens.get_mut(token_id) {
            api.last_used_at = Some(now);
            return Ok(());
        }
        Err(StoreError::NotFound)
    }
}

#[async_trait]
impl TemplateStore for MemoryStore {
    async fn get_template(
        &self,
        tenant_id: &str,
        provider_type: &ProviderType,
        operation: &str,
    ) -> Result<Option<OperationTemplate>, StoreError> {
        Ok(self
            .templates
            .get(&(
                tenant_id.to_string(),
                provider_type.to_string(),
                operation.to_string(),
            ))
            .map(|t| t.clone()))
    }

    async fn put_template(
        &self,
        tenant_id: &str,
        provider_type: &ProviderType,
        operation: &str,
        template: OperationTemplate,
    ) -> Result<(), StoreError> {
        self.templates.insert(
            (
                tenant_id.to_string(),
                provider_type.to_string(),
                operation.to_string(),
            ),
            template,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn pat(id: &str, hash: &str) -> PersonalAccessTokenRecord {
        PersonalAccessTokenRecord {
            id: id.into(),
            owner_id: "u-7".into(),
            name: "ci".into(),
            token_hash: hash.into(),
            encrypted_token: String::new(),
            expires_at: None,
            organization_ids: vec!["org-42".into()],
            sso_authorizations: BTreeMap::new(),
            last_used_at: None,
        }
    }

    #[tokio::test]
    async fn sso_authorization_merges_in_place() {
        let store = MemoryStore::new();
        store.insert_personal_access_token(pat("pat-1", "h1")).await.unwrap();

        let now = Utc::now();
        store.record_sso_authorization("pat-1", "org-42", now).await.unwrap();
        store.record_sso_authorization("pat-1", "org-9", now).await.unwrap();

        let record = store.find_personal_access_token("h1").await.unwrap().unwrap();
        assert_eq!(record.sso_authorizations.len(), 2);
        assert_eq!(record.sso_authorizations["org-42"], now);
    }

    #[tokio::test]
    async fn unknown_token_is_not_found() {
        let store = MemoryStore::new();
        let err = store.mark_last_used("nope", Utc::now()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn duplicate_token_ids_are_rejected() {
        let store = MemoryStore::new();
        store.insert_personal_access_token(pat("pat-1", "h1")).await.unwrap();
        let err = store
            .insert_personal_access_token(pat("pat-1", "h2"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }
}
