use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::tokens::ImpersonationType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthenticationType {
    Jwt,
    Pat,
    ApiToken,
}

/// The caller a request runs as.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticatedPrincipal {
    pub subject_id: String,
    pub subject_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subject_email: String,
    /// Active organization for this request.
    pub organization_id: String,
    pub organization_ids: Vec<String>,
    pub authentication_type: AuthenticationType,
    pub is_system_admin: bool,
}

impl AuthenticatedPrincipal {
    pub fn has_organization(&self, org_id: &str) -> bool {
        self.organization_id == org_id || self.organization_ids.iter().any(|o| o == org_id)
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for AuthenticatedPrincipal {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedPrincipal>()
            .cloned()
            .ok_or(AppError::Unauthorized)
    }
}

/// Present when the request carried a verified impersonation token.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImpersonatedPrincipal {
    pub target: AuthenticatedPrincipal,
    pub impersonator: AuthenticatedPrincipal,
    pub kind: ImpersonationType,
    pub session_id: String,
    pub scopes: Vec<String>,
    pub expires_at: DateTime<Utc>,
    pub reason: String,
}

impl ImpersonatedPrincipal {
    /// `*` grants every scope.
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == "*" || s == scope)
    }
}

/// The system admin that was swapped out by the admin overlay. Kept for audit.
#[derive(Debug, Clone, PartialEq)]
pub struct OriginalAdmin(pub AuthenticatedPrincipal);
