use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::{Extension, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::auth::{AuthError, AuthenticatedPrincipal, AuthenticationType, ImpersonatedPrincipal, OriginalAdmin};
use crate::errors::AppError;
use crate::store::TokenOwner;
use crate::tokens::{ImpersonationRequest, ImpersonationType, Jwks, TokenPair};
use crate::AppState;

pub async fn jwks(State(state): State<Arc<AppState>>) -> Json<Jwks> {
    Json(state.tokens.jwks())
}

#[derive(Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// Swaps a refresh token for a new pair. A consumed refresh token is
/// rejected on reuse.
pub async fn refresh(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RefreshRequest>,
) -> Result<Json<TokenPair>, AppError> {
    let pair = state
        .refresher
        .refresh(&body.refresh_token)
        .await
        .map_err(AuthError::from)?;
    Ok(Json(pair))
}

#[derive(Serialize)]
pub struct MeResponse {
    #[serde(flatten)]
    pub principal: AuthenticatedPrincipal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub impersonation: Option<ImpersonationView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acting_admin_id: Option<String>,
}

#[derive(Serialize)]
pub struct ImpersonationView {
    pub impersonator_id: String,
    pub session_id: String,
    pub scopes: Vec<String>,
    pub expires_at: chrono::DateTime<Utc>,
}

pub async fn me(
    principal: AuthenticatedPrincipal,
    impersonated: Option<Extension<ImpersonatedPrincipal>>,
    admin: Option<Extension<OriginalAdmin>>,
) -> Json<MeResponse> {
    Json(MeResponse {
        principal,
        impersonation: impersonated.map(|Extension(imp)| ImpersonationView {
            impersonator_id: imp.impersonator.subject_id,
            session_id: imp.session_id,
            scopes: imp.scopes,
            expires_at: imp.expires_at,
        }),
        acting_admin_id: admin.map(|Extension(OriginalAdmin(a))| a.subject_id),
    })
}

/// Organizations the caller can act in.
pub async fn organizations(
    State(state): State<Arc<AppState>>,
    principal: AuthenticatedPrincipal,
) -> Result<Json<Value>, AppError> {
    let mut orgs = Vec::with_capacity(principal.organization_ids.len());
    for id in &principal.organization_ids {
        if let Some(org) = state.identities.find_organization(id).await? {
            orgs.push(json!({
                "id": org.id,
                "name": org.name,
                "active": org.id == principal.organization_id,
            }));
        }
    }
    Ok(Json(json!({ "organizations": orgs })))
}

pub async fn modules(
    State(state): State<Arc<AppState>>,
    principal: AuthenticatedPrincipal,
) -> Result<Json<Value>, AppError> {
    let modules = state
        .features
        .get_modules(&principal.organization_id)
        .await?
        .unwrap_or_default();
    Ok(Json(json!({
        "organization_id": principal.organization_id,
        "modules": modules,
    })))
}

#[derive(Deserialize)]
pub struct SetModulesRequest {
    pub modules: Vec<String>,
}

/// System admins only.
pub async fn set_modules(
    State(state): State<Arc<AppState>>,
    principal: AuthenticatedPrincipal,
    Path(org_id): Path<String>,
    Json(body): Json<SetModulesRequest>,
) -> Result<StatusCode, AppError> {
    if !principal.is_system_admin {
        return Err(AppError::Unauthorized);
    }
    state.features.set_modules(&org_id, &body.modules).await?;
    tracing::info!(
        admin_id = %principal.subject_id,
        organization_id = %org_id,
        modules = ?body.modules,
        "updated enabled modules"
    );
    Ok(StatusCode::NO_CONTENT)
}

/// Records that the caller completed IdP sign-on for a token they own, in
/// their active organization. Only browser sessions (JWT) may do this.
pub async fn authorize_token_sso(
    State(state): State<Arc<AppState>>,
    principal: AuthenticatedPrincipal,
    Path(token_id): Path<String>,
) -> Result<StatusCode, AppError> {
    if principal.authentication_type != AuthenticationType::Jwt {
        return Err(AppError::Unauthorized);
    }
    let org_id = &principal.organization_id;
    let owned = match state.identities.token_owner(&token_id).await? {
        Some(TokenOwner::Personal {
            user_id,
            organization_ids,
        }) => user_id == principal.subject_id && organization_ids.contains(org_id),
        Some(TokenOwner::Service { organization_id }) => &organization_id == org_id,
        None => false,
    };
    if !owned {
        return Err(AppError::NotFound(format!("token {}", token_id)));
    }

    state
        .credentials
        .record_sso_authorization(&token_id, org_id, Utc::now())
        .await?;
    tracing::info!(
        token_id = %token_id,
        organization_id = %org_id,
        user_id = %principal.subject_id,
        "recorded token sso authorization"
    );
    Ok(StatusCode::NO_CONTENT)
}

// ── Impersonation ──────────────────────────────────────────────

const DEFAULT_IMPERSONATION_HOURS: u64 = 1;

#[derive(Deserialize)]
pub struct StartImpersonationRequest {
    pub target_user_id: String,
    /// Defaults to the caller's active organization.
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub reason: String,
    /// Lifetime in hours.
    #[serde(default)]
    pub duration: Option<u64>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Serialize)]
pub struct StartImpersonationReply {
    pub success: bool,
    pub token: String,
    pub session_id: String,
    pub expires_at: chrono::DateTime<Utc>,
    pub scopes: Vec<String>,
    pub message: &'static str,
}

/// Every impersonation type is reserved for system admins.
fn authorize_impersonation(
    principal: &AuthenticatedPrincipal,
    kind: ImpersonationType,
) -> Result<(), AppError> {
    if principal.is_system_admin {
        return Ok(());
    }
    let reason = match kind {
        ImpersonationType::Support => "insufficient permissions for support impersonation",
        ImpersonationType::Admin => "insufficient permissions for admin impersonation",
        ImpersonationType::Job => "job impersonation only allowed for system admins",
    };
    Err(AppError::Forbidden(reason.to_string()))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("")
}

fn client_ip(headers: &HeaderMap) -> &str {
    let forwarded = header_str(headers, "x-forwarded-for");
    match forwarded.split(',').next().map(str::trim) {
        Some(ip) if !ip.is_empty() => ip,
        _ => header_str(headers, "x-real-ip"),
    }
}

struct AuditEvent<'a> {
    action: &'static str,
    session_id: &'a str,
    kind: ImpersonationType,
    impersonator_id: &'a str,
    target_user_id: &'a str,
    organization_id: &'a str,
    reason: &'a str,
    scopes: &'a [String],
}

fn audit(event: AuditEvent<'_>, headers: &HeaderMap) {
    tracing::info!(
        action = event.action,
        session_id = %event.session_id,
        kind = event.kind.as_str(),
        impersonator_id = %event.impersonator_id,
        target_user_id = %event.target_user_id,
        organization_id = %event.organization_id,
        reason = %event.reason,
        scopes = ?event.scopes,
        ip_address = %client_ip(headers),
        user_agent = %header_str(headers, "user-agent"),
        "impersonation event"
    );
}

/// Opens an impersonation session as a system admin and returns the token
/// to send as `Authorization: Impersonation <token>`.
pub async fn start_impersonation(
    State(state): State<Arc<AppState>>,
    principal: AuthenticatedPrincipal,
    headers: HeaderMap,
    Json(body): Json<StartImpersonationRequest>,
) -> Result<Json<StartImpersonationReply>, AppError> {
    let target_id = body.target_user_id.trim();
    if target_id.is_empty() {
        return Err(AppError::Validation("target_user_id is required".into()));
    }
    let reason = body.reason.trim();
    if reason.is_empty() {
        return Err(AppError::Validation("reason is required".into()));
    }
    let kind: ImpersonationType = body.kind.parse().map_err(AppError::Validation)?;
    let hours = body.duration.unwrap_or(DEFAULT_IMPERSONATION_HOURS);
    if hours == 0 {
        return Err(AppError::Validation("duration must be at least one hour".into()));
    }

    authorize_impersonation(&principal, kind)?;
    if target_id == principal.subject_id {
        return Err(AppError::Validation("cannot impersonate yourself".into()));
    }

    let org_id = body
        .organization_id
        .as_deref()
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .unwrap_or(&principal.organization_id)
        .to_string();
    let target = state
        .identities
        .find_user(target_id)
        .await?
        .ok_or_else(|| AppError::NotFound("target user not found".into()))?;
    if state.identities.membership_role(&target.id, &org_id).await?.is_none() {
        return Err(AppError::NotFound(format!(
            "target user is not a member of organization {}",
            org_id
        )));
    }

    let scopes = if body.scopes.is_empty() {
        kind.default_scopes()
    } else {
        body.scopes
    };
    let session = state
        .tokens
        .open_impersonation_session(ImpersonationRequest {
            impersonator_id: principal.subject_id.clone(),
            impersonator_email: principal.subject_email.clone(),
            target_user_id: target.id.clone(),
            target_user_email: target.email.clone(),
            org_id: org_id.clone(),
            kind,
            reason: reason.to_string(),
            scopes: scopes.clone(),
            duration: Duration::from_secs(hours.saturating_mul(3600)),
        })
        .map_err(|e| AppError::Internal(anyhow::anyhow!("signing impersonation token: {}", e)))?;

    audit(
        AuditEvent {
            action: "start",
            session_id: &session.session_id,
            kind,
            impersonator_id: &principal.subject_id,
            target_user_id: &target.id,
            organization_id: &org_id,
            reason,
            scopes: &scopes,
        },
        &headers,
    );

    Ok(Json(StartImpersonationReply {
        success: true,
        token: session.token,
        session_id: session.session_id,
        expires_at: session.expires_at,
        scopes,
        message: "Impersonation session started successfully",
    }))
}

#[derive(Deserialize)]
pub struct EndImpersonationRequest {
    pub session_id: String,
    #[serde(default)]
    pub reason: String,
}

/// Closes the caller's impersonation session. Must be sent with the
/// impersonation token whose session it names.
pub async fn end_impersonation(
    impersonated: Option<Extension<ImpersonatedPrincipal>>,
    headers: HeaderMap,
    Json(body): Json<EndImpersonationRequest>,
) -> Result<Json<Value>, AppError> {
    let Some(Extension(imp)) = impersonated else {
        return Err(AppError::BadRequest("no active impersonation session".into()));
    };
    if body.session_id.trim().is_empty() {
        return Err(AppError::Validation("session_id is required".into()));
    }
    if imp.session_id != body.session_id.trim() {
        return Err(AppError::BadRequest("invalid session ID".into()));
    }

    audit(
        AuditEvent {
            action: "end",
            session_id: &imp.session_id,
            kind: imp.kind,
            impersonator_id: &imp.impersonator.subject_id,
            target_user_id: &imp.target.subject_id,
            organization_id: &imp.target.organization_id,
            reason: body.reason.trim(),
            scopes: &imp.scopes,
        },
        &headers,
    );

    Ok(Json(json!({
        "success": true,
        "message": "Impersonation session ended successfully",
    })))
}
