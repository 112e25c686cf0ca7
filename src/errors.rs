use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::auth::AuthError;
use crate::crypto::CryptoError;
use crate::integrations::IntegrationError;
use crate::store::StoreError;

/// HTTP boundary error. Every domain error funnels through here before it
/// leaves the process, so the wire codes stay stable.
#[derive(Debug, Error)]
pub enum AppError {
    /// Uniform authentication failure. The reason is logged, never returned.
    #[error("unauthorized")]
    Unauthorized,

    #[error("sso login required for organization {org_id}")]
    SsoRedirect { org_id: String },

    #[error("missing required scope: {0}")]
    ScopeDenied(String),

    #[error("organization does not have access to module")]
    ModuleNoAccess,

    #[error("impersonated requests are not permitted here")]
    ImpersonationBlocked,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("request timed out")]
    Timeout,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Unauthorized | AppError::ImpersonationBlocked => "UNAUTHORIZED",
            AppError::SsoRedirect { .. } => "UNAUTHORIZED",
            AppError::ScopeDenied(_) => "UNAUTHORIZED_SCOPE",
            AppError::ModuleNoAccess => "MODULE_NO_ACCESS",
            AppError::Forbidden(_) => "FORBIDDEN",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::Conflict(_) => "CONFLICT",
            AppError::AlreadyExists(_) => "ALREADY_EXISTS",
            AppError::Timeout => "REQUEST_TIMEOUT",
            AppError::Database(_) | AppError::Redis(_) | AppError::Internal(_) => {
                "INTERNAL_SERVER_ERROR"
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, msg) = match &self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, None),
            AppError::SsoRedirect { org_id } => {
                let location = sso_login_location(org_id);
                let mut response = StatusCode::FOUND.into_response();
                if let Ok(value) = HeaderValue::from_str(&location) {
                    response.headers_mut().insert(header::LOCATION, value);
                }
                return response;
            }
            AppError::ScopeDenied(scope) => (
                StatusCode::FORBIDDEN,
                Some(format!("missing required scope: {}", scope)),
            ),
            AppError::ModuleNoAccess => (
                StatusCode::FORBIDDEN,
                Some("organization does not have access to this module".to_string()),
            ),
            AppError::ImpersonationBlocked => (
                StatusCode::FORBIDDEN,
                Some("impersonated requests are not permitted on this endpoint".to_string()),
            ),
            AppError::Forbidden(e) => (StatusCode::FORBIDDEN, Some(e.clone())),
            AppError::NotFound(what) => (StatusCode::NOT_FOUND, Some(what.clone())),
            AppError::Validation(e) => (StatusCode::BAD_REQUEST, Some(e.clone())),
            AppError::BadRequest(e) => (StatusCode::BAD_REQUEST, Some(e.clone())),
            AppError::Conflict(e) => (StatusCode::CONFLICT, Some(e.clone())),
            AppError::AlreadyExists(e) => (StatusCode::CONFLICT, Some(e.clone())),
            AppError::Timeout => (StatusCode::REQUEST_TIMEOUT, None),
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Some("internal server error".to_string()),
                )
            }
            AppError::Redis(e) => {
                tracing::error!("Redis error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Some("internal server error".to_string()),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:#}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Some("internal server error".to_string()),
                )
            }
        };

        let body = match msg {
            Some(message) => json!({ "error": self.code(), "message": message }),
            None => json!({ "error": self.code() }),
        };

        (status, Json(body)).into_response()
    }
}

pub fn sso_login_location(org_id: &str) -> String {
    format!(
        "/v1/sso/login?organization_id={}",
        urlencoding::encode(org_id)
    )
}

// ── Domain → HTTP mapping ───────────────────────────────────────

impl From<AuthError> for AppError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::SsoRedirect { org_id } => AppError::SsoRedirect { org_id },
            AuthError::Store(StoreError::Database(db)) => AppError::Database(db),
            other => {
                tracing::debug!(reason = %other, "authentication failed");
                AppError::Unauthorized
            }
        }
    }
}

impl From<IntegrationError> for AppError {
    fn from(e: IntegrationError) -> Self {
        use IntegrationError as E;
        match e {
            E::ProviderUnavailable(p) => AppError::NotFound(format!("provider {} is not available", p)),
            E::OperationNotFound(op) => AppError::NotFound(format!("operation {} not found", op)),
            E::CredentialNotFound => AppError::NotFound("integration credential not found".into()),
            E::OperationTemplateRequired
            | E::OperationTemplateOverridesNotAllowed
            | E::OperationTemplateOverrideNotAllowed(_)
            | E::ConfigDecode(_)
            | E::MetadataMissing(_)
            | E::MetadataInvalid(_)
            | E::OAuthTokenMissing
            | E::AccessTokenEmpty
            | E::ApiTokenMissing => AppError::Validation(e.to_string()),
            E::AuthTypeMismatch { .. } | E::BeginAuthNotSupported(_) => {
                AppError::BadRequest(e.to_string())
            }
            E::StateMismatch => AppError::BadRequest(e.to_string()),
            E::Store(StoreError::Database(db)) => AppError::Database(db),
            other => AppError::Internal(anyhow::anyhow!(other)),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => AppError::NotFound("record not found".into()),
            StoreError::Database(db) => AppError::Database(db),
            other => AppError::Internal(anyhow::anyhow!(other)),
        }
    }
}

impl From<CryptoError> for AppError {
    fn from(e: CryptoError) -> Self {
        AppError::Internal(anyhow::anyhow!(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn unauthorized_body_is_uniform() {
        let resp = AppError::Unauthorized.into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(resp).await;
        assert_eq!(body, json!({ "error": "UNAUTHORIZED" }));
    }

    #[tokio::test]
    async fn sso_redirect_sets_location() {
        let resp = AppError::SsoRedirect { org_id: "org-42".into() }.into_response();
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(
            resp.headers().get(header::LOCATION).unwrap(),
            "/v1/sso/login?organization_id=org-42"
        );
    }

    #[tokio::test]
    async fn scope_denied_is_forbidden() {
        let resp = AppError::ScopeDenied("write".into()).into_response();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let body = body_json(resp).await;
        assert_eq!(body["error"], "UNAUTHORIZED_SCOPE");
    }

    #[test]
    fn template_errors_are_validation() {
        let err: AppError = IntegrationError::OperationTemplateOverridesNotAllowed.into();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        let err: AppError = IntegrationError::OperationNotFound("x".into()).into();
        assert_eq!(err.code(), "NOT_FOUND");
    }
}
