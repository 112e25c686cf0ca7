use axum::http::HeaderMap;

use super::middleware::ORGANIZATION_HEADER;
use super::principal::{AuthenticatedPrincipal, OriginalAdmin};
use super::AuthError;
use crate::store::IdentityStore;

pub const USER_HEADER: &str = "x-user-id";

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Lets a system admin act as another user. With both `X-User-ID` and
/// `X-Organization-ID` present the principal becomes that user in that
/// organization and the admin is returned for the audit trail. Anyone else,
/// or an admin missing either header, passes through unchanged.
pub async fn overlay(
    identities: &dyn IdentityStore,
    principal: AuthenticatedPrincipal,
    headers: &HeaderMap,
) -> Result<(AuthenticatedPrincipal, Option<OriginalAdmin>), AuthError> {
    if !principal.is_system_admin {
        return Ok((principal, None));
    }
    let (Some(user_id), Some(org_id)) = (header(headers, USER_HEADER), header(headers, ORGANIZATION_HEADER))
    else {
        return Ok((principal, None));
    };

    let user = identities
        .find_user(user_id)
        .await?
        .ok_or(AuthError::InvalidCredentials)?;
    let org = identities
        .find_organization(org_id)
        .await?
        .ok_or(AuthError::InvalidCredentials)?;

    tracing::info!(
        admin_id = %principal.subject_id,
        target_user_id = %user.id,
        organization_id = %org.id,
        "system admin acting as user"
    );

    let target = AuthenticatedPrincipal {
        subject_id: user.id,
        subject_name: user.display_name,
        subject_email: user.email,
        organization_id: org.id.clone(),
        organization_ids: vec![org.id],
        authentication_type: principal.authentication_type,
        is_system_admin: false,
    };
    Ok((target, Some(OriginalAdmin(principal))))
}
