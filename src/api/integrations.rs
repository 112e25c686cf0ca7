use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::time::Instant;

use crate::auth::AuthenticatedPrincipal;
use crate::errors::AppError;
use crate::integrations::provider::{Provider, ProviderSummary};
use crate::integrations::types::{
    AuthContext, AuthSession, CredentialSubject, OperationResult, OperationTemplate, ProviderType,
    SubjectInputs,
};
use crate::integrations::IntegrationError;
use crate::AppState;

fn provider(state: &AppState, name: &str) -> Result<Arc<Provider>, IntegrationError> {
    let provider_type = ProviderType::new(name);
    state
        .runner
        .catalog()
        .get(&provider_type)
        .ok_or(IntegrationError::ProviderUnavailable(provider_type))
}

pub async fn list(State(state): State<Arc<AppState>>) -> Json<Vec<ProviderSummary>> {
    Json(state.runner.catalog().list())
}

#[derive(Debug, Default, Deserialize)]
pub struct StartAuthRequest {
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

pub async fn start_auth(
    State(state): State<Arc<AppState>>,
    principal: AuthenticatedPrincipal,
    Path(name): Path<String>,
    body: Option<Json<StartAuthRequest>>,
) -> Result<Json<AuthSession>, AppError> {
    let provider = provider(&state, &name)?;
    let Json(body) = body.unwrap_or_default();
    let redirect_uri = body.redirect_uri.unwrap_or_else(|| {
        format!(
            "{}/v1/integrations/{}/auth/callback",
            state.config.public_url.trim_end_matches('/'),
            name
        )
    });
    let ctx = AuthContext {
        tenant_id: principal.organization_id.clone(),
        subject_id: principal.subject_id.clone(),
        redirect_uri,
        scopes: body.scopes,
    };
    let session = provider.begin_auth(&ctx)?;
    state.auth_sessions.remember(&ctx, &session);
    tracing::info!(
        tenant_id = %ctx.tenant_id,
        provider = %name,
        "started integration auth"
    );
    Ok(Json(session))
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: String,
    pub state: String,
}

#[derive(Debug, Serialize)]
pub struct StoredCredentialResponse {
    pub credential_id: String,
    pub provider_type: ProviderType,
}

pub async fn auth_callback(
    State(state): State<Arc<AppState>>,
    principal: AuthenticatedPrincipal,
    Path(name): Path<String>,
    Query(query): Query<CallbackQuery>,
) -> Result<Json<StoredCredentialResponse>, AppError> {
    let provider = provider(&state, &name)?;
    let pending = state
        .auth_sessions
        .take(&principal.organization_id, provider.provider_type(), &query.state)?;
    let inputs = provider
        .complete_auth(&state.http, &query.code, &pending.redirect_uri)
        .await?;
    let subject = CredentialSubject {
        tenant_id: pending.tenant_id,
        subject_id: pending.subject_id,
        provider_type: provider.provider_type().clone(),
        display_name: principal.subject_name,
        credential_id: uuid::Uuid::new_v4().to_string(),
        inputs,
    };
    store_credential(&state, &provider, subject).await.map(Json)
}

/// Stores a credential submitted directly (API token or metadata form).
pub async fn submit_credentials(
    State(state): State<Arc<AppState>>,
    principal: AuthenticatedPrincipal,
    Path(name): Path<String>,
    Json(inputs): Json<SubjectInputs>,
) -> Result<Json<StoredCredentialResponse>, AppError> {
    let provider = provider(&state, &name)?;
    let subject = CredentialSubject {
        tenant_id: principal.organization_id,
        subject_id: principal.subject_id,
        provider_type: provider.provider_type().clone(),
        display_name: principal.subject_name,
        credential_id: uuid::Uuid::new_v4().to_string(),
        inputs,
    };
    store_credential(&state, &provider, subject).await.map(Json)
}

async fn store_credential(
    state: &AppState,
    provider: &Provider,
    subject: CredentialSubject,
) -> Result<StoredCredentialResponse, AppError> {
    let payload = provider.mint(&state.http, &subject).await?;
    let credential_id = state
        .vault
        .put_payload(&subject.tenant_id, provider.provider_type(), &payload)
        .await?;
    // Pooled clients were built from the previous credential.
    state
        .runner
        .pool()
        .evict(&subject.tenant_id, provider.provider_type());
    Ok(StoredCredentialResponse {
        credential_id,
        provider_type: provider.provider_type().clone(),
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct RunOperationRequest {
    #[serde(default)]
    pub config: Map<String, Value>,
}

pub async fn run_operation(
    State(state): State<Arc<AppState>>,
    principal: AuthenticatedPrincipal,
    Path((name, operation)): Path<(String, String)>,
    body: Option<Json<RunOperationRequest>>,
) -> Result<Json<OperationResult>, AppError> {
    let Json(body) = body.unwrap_or_default();
    let deadline = Instant::now() + state.config.request_timeout;
    let result = state
        .runner
        .run(
            &principal.organization_id,
            &ProviderType::new(name),
            &operation,
            body.config,
            deadline,
        )
        .await?;
    Ok(Json(result))
}

pub async fn put_template(
    State(state): State<Arc<AppState>>,
    principal: AuthenticatedPrincipal,
    Path((name, operation)): Path<(String, String)>,
    Json(template): Json<OperationTemplate>,
) -> Result<StatusCode, AppError> {
    let provider = provider(&state, &name)?;
    if provider.operation(&operation).is_none() {
        return Err(IntegrationError::OperationNotFound(operation).into());
    }
    state
        .templates
        .put_template(
            &principal.organization_id,
            provider.provider_type(),
            &operation,
            template,
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Removes the tenant's credential and any clients built from it.
pub async fn disconnect(
    State(state): State<Arc<AppState>>,
    principal: AuthenticatedPrincipal,
    Path(name): Path<String>,
) -> Result<Json<Value>, AppError> {
    let provider_type = ProviderType::new(name);
    let deleted = state
        .vault
        .delete(&principal.organization_id, &provider_type)
        .await?;
    let evicted = state
        .runner
        .pool()
        .evict(&principal.organization_id, &provider_type);
    tracing::info!(
        tenant_id = %principal.organization_id,
        provider = %provider_type,
        deleted,
        evicted,
        "disconnected integration"
    );
    Ok(Json(json!({ "deleted": deleted })))
}
