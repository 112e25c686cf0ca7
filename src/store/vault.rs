use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use super::{CredentialStore, StoreError, StoredCredential};
use crate::crypto::Envelope;
use crate::integrations::types::{
    CredentialKind, CredentialPayload, CredentialSet, OAuthToken, ProviderType,
};

/// Credential persistence with field encryption applied on the way in and
/// out. Secret fields become envelope ciphertext columns; metadata stays
/// in plaintext.
#[derive(Clone)]
pub struct CredentialVault {
    store: Arc<dyn CredentialStore>,
    envelope: Envelope,
}

impl CredentialVault {
    pub fn new(store: Arc<dyn CredentialStore>, envelope: Envelope) -> Self {
        Self { store, envelope }
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    pub async fn get_payload(
        &self,
        tenant_id: &str,
        provider_type: &ProviderType,
    ) -> Result<CredentialPayload, StoreError> {
        let row = self
            .store
            .latest_credential(tenant_id, provider_type.as_str())
            .await?
            .ok_or(StoreError::NotFound)?;
        self.open(row)
    }

    pub async fn put_payload(
        &self,
        tenant_id: &str,
        provider_type: &ProviderType,
        payload: &CredentialPayload,
    ) -> Result<String, StoreError> {
        let row = self.seal(tenant_id, provider_type, payload)?;
        let id = row.id.clone();
        self.store.insert_credential(row).await?;
        tracing::info!(
            tenant_id = %tenant_id,
            provider = %provider_type,
            kind = payload.kind.as_str(),
            credential_id = %id,
            "stored integration credential"
        );
        Ok(id)
    }

    pub async fn delete(&self, tenant_id: &str, provider_type: &ProviderType) -> Result<u64, StoreError> {
        self.store
            .delete_credentials(tenant_id, provider_type.as_str())
            .await
    }

    fn seal(
        &self,
        tenant_id: &str,
        provider_type: &ProviderType,
        payload: &CredentialPayload,
    ) -> Result<StoredCredential, StoreError> {
        let seal = |v: &Option<String>| -> Result<Option<String>, StoreError> {
            v.as_deref()
                .map(|s| self.envelope.encrypt_str(s))
                .transpose()
                .map_err(StoreError::from)
        };

        let oauth = payload.oauth_token.as_ref();
        let set = payload.credential_set.as_ref();
        Ok(StoredCredential {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            provider_type: provider_type.to_string(),
            kind: payload.kind.as_str().to_string(),
            oauth_access_token: seal(&oauth.map(|t| t.access_token.clone()))?,
            oauth_refresh_token: seal(&oauth.and_then(|t| t.refresh_token.clone()))?,
            oauth_expires_at: oauth.and_then(|t| t.expires_at),
            oauth_token_type: oauth.map(|t| t.token_type.clone()),
            oauth_scopes: oauth.map(|t| t.scopes.clone()).unwrap_or_default(),
            api_token: seal(&payload.api_token)?,
            aws_access_key_id: seal(&set.and_then(|s| s.access_key_id.clone()))?,
            aws_secret_access_key: seal(&set.and_then(|s| s.secret_access_key.clone()))?,
            aws_session_token: seal(&set.and_then(|s| s.session_token.clone()))?,
            provider_data: set
                .map(|s| Value::Object(s.provider_data.clone()))
                .unwrap_or(Value::Null),
            sso_authorizations: payload.sso_authorizations.clone(),
            created_at: Utc::now(),
        })
    }

    fn open(&self, row: StoredCredential) -> Result<CredentialPayload, StoreError> {
        let open = |column: &'static str, v: &Option<String>| -> Result<Option<String>, StoreError> {
            match v.as_deref() {
                None => Ok(None),
                Some(ct) => self.envelope.decrypt_str(ct).map(Some).map_err(|e| {
                    tracing::warn!(
                        credential_id = %row.id,
                        column,
                        error = %e,
                        "failed to decrypt credential column"
                    );
                    StoreError::Crypto(e)
                }),
            }
        };

        let kind = CredentialKind::parse(&row.kind)
            .ok_or_else(|| StoreError::Malformed(format!("unknown credential kind {}", row.kind)))?;

        let oauth_token = match open("oauth_access_token", &row.oauth_access_token)? {
            Some(access_token) => Some(OAuthToken {
                access_token,
                refresh_token: open("oauth_refresh_token", &row.oauth_refresh_token)?,
                expires_at: row.oauth_expires_at,
                token_type: row
                    .oauth_token_type
                    .clone()
                    .unwrap_or_else(|| "Bearer".to_string()),
                scopes: row.oauth_scopes.clone(),
            }),
            None => None,
        };

        let access_key_id = open("aws_access_key_id", &row.aws_access_key_id)?;
        let secret_access_key = open("aws_secret_access_key", &row.aws_secret_access_key)?;
        let session_token = open("aws_session_token", &row.aws_session_token)?;
        let provider_data = match &row.provider_data {
            Value::Object(map) => Some(map.clone()),
            _ => None,
        };
        let credential_set = if access_key_id.is_some()
            || secret_access_key.is_some()
            || session_token.is_some()
            || provider_data.is_some()
        {
            Some(CredentialSet {
                access_key_id,
                secret_access_key,
                session_token,
                provider_data: provider_data.unwrap_or_default(),
            })
        } else {
            None
        };

        Ok(CredentialPayload {
            provider_type: ProviderType::new(row.provider_type.clone()),
            kind,
            oauth_token,
            api_token: open("api_token", &row.api_token)?,
            credential_set,
            sso_authorizations: row.sso_authorizations.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keyset;
    use crate::store::memory::MemoryStore;
    use base64::engine::general_purpose::STANDARD as B64;
    use base64::Engine;

    fn vault() -> (CredentialVault, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let vault = CredentialVault::new(store.clone(), Envelope::new(Keyset::generate()));
        (vault, store)
    }

    fn oauth_payload() -> CredentialPayload {
        let mut payload = CredentialPayload::new("github".into(), CredentialKind::OauthToken);
        payload.oauth_token = Some(OAuthToken {
            access_token: "gho_access".into(),
            refresh_token: Some("ghr_refresh".into()),
            expires_at: None,
            token_type: "Bearer".into(),
            scopes: vec!["repo".into()],
        });
        payload
    }

    #[tokio::test]
    async fn payload_roundtrips_and_secrets_are_sealed() {
        let (vault, store) = vault();
        let provider = ProviderType::new("github");
        vault.put_payload("org-1", &provider, &oauth_payload()).await.unwrap();

        let row = store.latest_credential("org-1", "github").await.unwrap().unwrap();
        let sealed = row.oauth_access_token.clone().unwrap();
        assert_ne!(sealed, "gho_access", "secret must not be stored in plaintext");

        let payload = vault.get_payload("org-1", &provider).await.unwrap();
        assert_eq!(payload, oauth_payload());
    }

    #[tokio::test]
    async fn missing_credential_is_not_found() {
        let (vault, _) = vault();
        let err = vault
            .get_payload("org-1", &ProviderType::new("github"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn tampered_column_is_crypto_failure() {
        let (vault, store) = vault();
        let provider = ProviderType::new("github");
        vault.put_payload("org-1", &provider, &oauth_payload()).await.unwrap();

        let mut row = store.latest_credential("org-1", "github").await.unwrap().unwrap();
        let mut raw = B64.decode(row.oauth_access_token.as_ref().unwrap()).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        row.oauth_access_token = Some(B64.encode(raw));
        row.created_at = Utc::now() + chrono::Duration::seconds(1);
        store.insert_credential(row).await.unwrap();

        let err = vault.get_payload("org-1", &provider).await.unwrap_err();
        assert!(matches!(err, StoreError::Crypto(_)));
    }
}
