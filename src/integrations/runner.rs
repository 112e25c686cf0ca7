use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::time::Instant;

use super::catalog::Catalog;
use super::operations::{
    ClientBuildContext, OperationDescriptor, OperationFailure, OperationInput, SharedClient,
};
use super::pool::{credential_fingerprint, ClientPool, PooledClient};
use super::provider::Provider;
use super::types::{AuthType, CredentialPayload, OperationResult, OperationStatus, ProviderType};
use super::IntegrationError;
use crate::store::{CredentialVault, StoreError, TemplateStore};

/// Executes named provider operations for a tenant.
#[derive(Clone)]
pub struct OperationRunner {
    catalog: Arc<Catalog>,
    vault: CredentialVault,
    templates: Arc<dyn TemplateStore>,
    pool: Arc<ClientPool>,
    http: reqwest::Client,
}

/// Keeps a pooled borrow alive for the duration of the call.
enum ClientLease {
    None,
    OneShot(SharedClient),
    Pooled(PooledClient),
}

impl ClientLease {
    fn client(&self) -> Option<SharedClient> {
        match self {
            ClientLease::None => None,
            ClientLease::OneShot(c) => Some(c.clone()),
            ClientLease::Pooled(p) => Some(p.client()),
        }
    }
}

impl OperationRunner {
    pub fn new(
        catalog: Arc<Catalog>,
        vault: CredentialVault,
        templates: Arc<dyn TemplateStore>,
        pool: Arc<ClientPool>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            catalog,
            vault,
            templates,
            pool,
            http,
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn pool(&self) -> &Arc<ClientPool> {
        &self.pool
    }

    /// Runs `operation` for the tenant. Transport failures come back as a
    /// `failed` result; configuration and credential problems as errors.
    pub async fn run(
        &self,
        tenant_id: &str,
        provider_type: &ProviderType,
        operation: &str,
        overrides: Map<String, Value>,
        deadline: Instant,
    ) -> Result<OperationResult, IntegrationError> {
        let provider = self
            .catalog
            .get(provider_type)
            .ok_or_else(|| IntegrationError::ProviderUnavailable(provider_type.clone()))?;
        let op = provider
            .operation(operation)
            .ok_or_else(|| IntegrationError::OperationNotFound(operation.to_string()))?
            .clone();

        let merged = self.merge_template(tenant_id, provider_type, &op, overrides).await?;
        let config = op.config_schema.decode(&merged)?;
        let credential = self.load_credential(tenant_id, &provider).await?;
        let lease = match self.lease_client(tenant_id, &provider, &op, &credential, deadline).await {
            Ok(lease) => lease,
            Err(IntegrationError::Transport(msg)) => {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    provider = %provider_type,
                    operation = %op.name,
                    error = %msg,
                    "client build failed"
                );
                return Ok(OperationResult::failed(
                    format!("{} {} failed", provider_type, op.name),
                    msg,
                ));
            }
            Err(e) => return Err(e),
        };

        let Some(run) = op.run.clone() else {
            return Err(IntegrationError::OperationNotFound(operation.to_string()));
        };
        let input = OperationInput {
            credential,
            config,
            client: lease.client(),
            http: self.http.clone(),
        };

        let outcome = match tokio::time::timeout_at(deadline, run(input)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(OperationFailure::new(IntegrationError::Transport(
                "operation deadline exceeded".into(),
            ))),
        };
        drop(lease);

        let result = normalize(provider_type, &op, outcome)?;
        tracing::info!(
            tenant_id = %tenant_id,
            provider = %provider_type,
            operation = %op.name,
            status = ?result.status,
            "integration operation finished"
        );
        Ok(result)
    }

    async fn merge_template(
        &self,
        tenant_id: &str,
        provider_type: &ProviderType,
        op: &OperationDescriptor,
        overrides: Map<String, Value>,
    ) -> Result<Map<String, Value>, IntegrationError> {
        let template = self
            .templates
            .get_template(tenant_id, provider_type, &op.name)
            .await?;
        match template {
            Some(template) => template.apply(&overrides),
            None if op.requires_template => Err(IntegrationError::OperationTemplateRequired),
            None => Ok(overrides),
        }
    }

    async fn load_credential(
        &self,
        tenant_id: &str,
        provider: &Provider,
    ) -> Result<CredentialPayload, IntegrationError> {
        let credential = match self.vault.get_payload(tenant_id, provider.provider_type()).await {
            Ok(c) => c,
            Err(StoreError::NotFound) => return Err(IntegrationError::CredentialNotFound),
            Err(e) => return Err(e.into()),
        };

        match provider.auth_type() {
            AuthType::OAuth2 | AuthType::Oidc => {
                let token = credential
                    .oauth_token
                    .as_ref()
                    .ok_or(IntegrationError::OAuthTokenMissing)?;
                if token.access_token.trim().is_empty() {
                    return Err(IntegrationError::AccessTokenEmpty);
                }
            }
            AuthType::ApiToken => {
                if credential.api_token.as_deref().map_or(true, |t| t.trim().is_empty()) {
                    return Err(IntegrationError::ApiTokenMissing);
                }
            }
            AuthType::AwsFederation => {}
        }
        Ok(credential)
    }

    async fn lease_client(
        &self,
        tenant_id: &str,
        provider: &Provider,
        op: &OperationDescriptor,
        credential: &CredentialPayload,
        deadline: Instant,
    ) -> Result<ClientLease, IntegrationError> {
        let Some(name) = op.client_name.as_deref() else {
            return Ok(ClientLease::None);
        };
        let Some(build) = provider.client(name).and_then(|c| c.build.clone()) else {
            return Ok(ClientLease::None);
        };
        let ctx = ClientBuildContext {
            credential: credential.clone(),
            http: self.http.clone(),
        };

        if provider.capabilities().supports_client_pooling {
            let fingerprint = credential_fingerprint(credential);
            let pooled = self
                .pool
                .checkout(
                    tenant_id,
                    provider.provider_type(),
                    name,
                    &fingerprint,
                    deadline,
                    move || build(ctx),
                )
                .await?;
            return Ok(ClientLease::Pooled(pooled));
        }

        let client = tokio::time::timeout_at(deadline, build(ctx))
            .await
            .map_err(|_| IntegrationError::Transport("client build deadline exceeded".into()))??;
        Ok(ClientLease::OneShot(client))
    }
}

/// Folds an operation outcome into a result. Failures that carry a partial
/// result, and plain transport failures, become `failed` results; anything
/// else propagates as a typed error.
fn normalize(
    provider_type: &ProviderType,
    op: &OperationDescriptor,
    outcome: Result<OperationResult, OperationFailure>,
) -> Result<OperationResult, IntegrationError> {
    match outcome {
        Ok(result) => Ok(result),
        Err(OperationFailure {
            result: Some(mut result),
            error,
        }) => {
            if result.status != OperationStatus::Failed {
                result.status = OperationStatus::Failed;
            }
            if !result.details.contains_key("error") {
                result.details.insert("error".into(), Value::String(error.to_string()));
            }
            Ok(result)
        }
        Err(OperationFailure {
            result: None,
            error: IntegrationError::Transport(msg),
        }) => Ok(OperationResult::failed(
            format!("{} {} failed", provider_type, op.name),
            msg,
        )),
        Err(OperationFailure { result: None, error }) => Err(error),
    }
}
