use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use super::bearer::{self, Credential};
use super::middleware::Authenticator;
use super::principal::{AuthenticatedPrincipal, AuthenticationType, ImpersonatedPrincipal};
use super::AuthError;
use crate::errors::AppError;

/// Verifies an `Impersonation` bearer and runs the request as its target.
/// The impersonator stays available through [`ImpersonatedPrincipal`].
pub async fn impersonation(
    State(auth): State<Arc<Authenticator>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = match bearer::from_authorization(req.headers())? {
        Some(Credential::Impersonation(token)) => token,
        _ => return Ok(next.run(req).await),
    };

    let claims = auth
        .validator()
        .verify_impersonation(&token)
        .await
        .map_err(AuthError::from)?;
    let identities = auth.identities();
    let target_user = identities
        .find_user(&claims.target_user_id)
        .await
        .map_err(AuthError::from)?
        .ok_or(AuthError::InvalidCredentials)?;

    let impersonator = match req.extensions().get::<AuthenticatedPrincipal>() {
        Some(p) if p.subject_id == claims.impersonator_id => p.clone(),
        Some(p) => {
            tracing::warn!(
                session_user_id = %p.subject_id,
                impersonator_id = %claims.impersonator_id,
                session_id = %claims.session_id,
                "impersonation token presented by another user"
            );
            return Err(AuthError::InvalidCredentials.into());
        }
        None => {
            let user = identities
                .find_user(&claims.impersonator_id)
                .await
                .map_err(AuthError::from)?
                .ok_or(AuthError::InvalidCredentials)?;
            AuthenticatedPrincipal {
                subject_id: user.id,
                subject_name: user.display_name,
                subject_email: user.email,
                organization_id: claims.org_id.clone(),
                organization_ids: vec![claims.org_id.clone()],
                authentication_type: AuthenticationType::Jwt,
                is_system_admin: user.is_system_admin,
            }
        }
    };

    let target = AuthenticatedPrincipal {
        subject_id: target_user.id,
        subject_name: target_user.display_name,
        subject_email: target_user.email,
        organization_id: claims.org_id.clone(),
        organization_ids: vec![claims.org_id.clone()],
        authentication_type: AuthenticationType::Jwt,
        is_system_admin: false,
    };

    tracing::info!(
        impersonator_id = %impersonator.subject_id,
        target_user_id = %target.subject_id,
        session_id = %claims.session_id,
        kind = ?claims.kind,
        "impersonated request"
    );

    let expires_at = claims.expires_at();
    req.extensions_mut().insert(ImpersonatedPrincipal {
        target: target.clone(),
        impersonator,
        kind: claims.kind,
        session_id: claims.session_id,
        scopes: claims.scopes,
        expires_at,
        reason: claims.reason,
    });
    req.extensions_mut().insert(target);
    Ok(next.run(req).await)
}

/// Scope an impersonated request must carry.
#[derive(Debug, Clone, Copy)]
pub struct RequiredScope(pub &'static str);

/// Rejects impersonated requests lacking the scope. Ordinary requests pass.
pub async fn require_scope(
    State(RequiredScope(scope)): State<RequiredScope>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    if let Some(imp) = req.extensions().get::<ImpersonatedPrincipal>() {
        if !imp.has_scope(scope) {
            tracing::warn!(
                session_id = %imp.session_id,
                required = scope,
                "impersonation scope denied"
            );
            return Err(AppError::ScopeDenied(scope.to_string()));
        }
    }
    Ok(next.run(req).await)
}

/// Refuses any impersonated request.
pub async fn block_impersonation(req: Request, next: Next) -> Result<Response, AppError> {
    if req.extensions().get::<ImpersonatedPrincipal>().is_some() {
        return Err(AppError::ImpersonationBlocked);
    }
    Ok(next.run(req).await)
}
