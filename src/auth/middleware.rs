use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};

use super::bearer::{self, Credential};
use super::opaque::{self, TokenShape};
use super::principal::{AuthenticatedPrincipal, AuthenticationType};
use super::{admin, sso, AuthError};
use crate::crypto::{self, Envelope};
use crate::errors::AppError;
use crate::store::{CredentialStore, IdentityStore, OrgRole, SsoAuthorizations, StoreError};
use crate::tokens::{Claims, TokenError, TokenPair, TokenRefresher, TokenValidator};

pub const ORGANIZATION_HEADER: &str = "x-organization-id";

/// Swaps a refresh token for a new pair on behalf of the middleware.
#[async_trait]
pub trait Reauthenticator: Send + Sync {
    async fn reauthenticate(&self, refresh_token: &str) -> Result<TokenPair, AuthError>;
}

#[async_trait]
impl Reauthenticator for TokenRefresher {
    async fn reauthenticate(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        Ok(self.refresh(refresh_token).await?)
    }
}

/// Returns true for requests that bypass authentication entirely.
pub type Skipper = Arc<dyn Fn(&Request) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct AuthOptions {
    pub access_cookie: String,
    pub refresh_cookie: String,
    pub sso_freshness: Duration,
    pub refresh_timeout: Duration,
    pub cookie_secure: bool,
    pub skipper: Option<Skipper>,
}

impl Default for AuthOptions {
    fn default() -> Self {
        Self {
            access_cookie: "access_token".into(),
            refresh_cookie: "refresh_token".into(),
            sso_freshness: Duration::from_secs(86_400),
            refresh_timeout: Duration::from_secs(5),
            cookie_secure: true,
            skipper: None,
        }
    }
}

struct Session {
    principal: AuthenticatedPrincipal,
    refreshed: Option<TokenPair>,
}

impl From<AuthenticatedPrincipal> for Session {
    fn from(principal: AuthenticatedPrincipal) -> Self {
        Self {
            principal,
            refreshed: None,
        }
    }
}

/// Everything the authentication middleware needs, shared across requests.
pub struct Authenticator {
    options: AuthOptions,
    validator: Arc<dyn TokenValidator>,
    identities: Arc<dyn IdentityStore>,
    credentials: Arc<dyn CredentialStore>,
    envelope: Envelope,
    reauth: Option<Arc<dyn Reauthenticator>>,
}

impl Authenticator {
    pub fn new(
        options: AuthOptions,
        validator: Arc<dyn TokenValidator>,
        identities: Arc<dyn IdentityStore>,
        credentials: Arc<dyn CredentialStore>,
        envelope: Envelope,
    ) -> Self {
        Self {
            options,
            validator,
            identities,
            credentials,
            envelope,
            reauth: None,
        }
    }

    pub fn with_reauthenticator(mut self, reauth: Arc<dyn Reauthenticator>) -> Self {
        self.reauth = Some(reauth);
        self
    }

    pub fn validator(&self) -> &Arc<dyn TokenValidator> {
        &self.validator
    }

    pub fn identities(&self) -> &Arc<dyn IdentityStore> {
        &self.identities
    }

    pub fn options(&self) -> &AuthOptions {
        &self.options
    }

    /// Resolves the caller. `Ok(None)` means the request carries an
    /// impersonation token and nothing else; the impersonation layer
    /// decides what to do with it.
    async fn resolve(&self, headers: &HeaderMap) -> Result<Option<Session>, AuthError> {
        let token = match bearer::from_authorization(headers)? {
            Some(Credential::Bearer(token)) => Some(token),
            Some(Credential::Impersonation(_)) => {
                match bearer::cookie(headers, &self.options.access_cookie) {
                    Some(token) => Some(token),
                    None => return Ok(None),
                }
            }
            None => bearer::cookie(headers, &self.options.access_cookie),
        };
        let refresh = bearer::cookie(headers, &self.options.refresh_cookie);

        let Some(token) = token else {
            let refresh = refresh.ok_or(AuthError::NoAuthorization)?;
            return self.refresh_session(&refresh).await.map(Some);
        };

        match opaque::classify(&token) {
            TokenShape::PersonalAccessToken => {
                return self.authenticate_pat(&token, headers).await.map(|p| Some(p.into()))
            }
            TokenShape::ApiToken => {
                return self.authenticate_api_token(&token).await.map(|p| Some(p.into()))
            }
            TokenShape::Unknown => {}
        }

        match self.validator.verify_access(&token).await {
            Ok(claims) => Ok(Some(self.jwt_principal(&claims).await?.into())),
            Err(TokenError::TokenExpired) => match refresh {
                Some(refresh) => self.refresh_session(&refresh).await.map(Some),
                None => Err(AuthError::ExpiredCredentials),
            },
            Err(TokenError::MalformedToken) => {
                let principal = match self.authenticate_pat(&token, headers).await {
                    Err(AuthError::InvalidCredentials) => self.authenticate_api_token(&token).await?,
                    other => other?,
                };
                Ok(Some(principal.into()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<Session, AuthError> {
        let reauth = self.reauth.as_ref().ok_or(AuthError::RefreshDisabled)?;
        tracing::info!(
            event = "refresh_attempt",
            token_fingerprint = %crypto::fingerprint(refresh_token),
            "refreshing expired session"
        );
        let pair = tokio::time::timeout(self.options.refresh_timeout, reauth.reauthenticate(refresh_token))
            .await
            .map_err(|_| AuthError::RefreshTimeout)??;
        let claims = self.validator.verify_access(&pair.access_token).await?;
        let principal = self.jwt_principal(&claims).await?;
        Ok(Session {
            principal,
            refreshed: Some(pair),
        })
    }

    async fn jwt_principal(&self, claims: &Claims) -> Result<AuthenticatedPrincipal, AuthError> {
        let user = self
            .identities
            .find_user(&claims.user_id)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;
        let org = self
            .identities
            .find_organization(&claims.org_id)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;
        Ok(AuthenticatedPrincipal {
            subject_id: user.id,
            subject_name: user.display_name,
            subject_email: user.email,
            organization_id: org.id.clone(),
            organization_ids: vec![org.id],
            authentication_type: AuthenticationType::Jwt,
            is_system_admin: user.is_system_admin,
        })
    }

    async fn authenticate_pat(
        &self,
        token: &str,
        headers: &HeaderMap,
    ) -> Result<AuthenticatedPrincipal, AuthError> {
        let pat = self
            .identities
            .find_personal_access_token(&opaque::hash_token(token))
            .await?
            .ok_or(AuthError::InvalidCredentials)?;
        self.confirm(token, &pat.encrypted_token, &pat.id)?;

        let now = Utc::now();
        check_expiry(pat.expires_at, now)?;
        if pat.organization_ids.is_empty() {
            return Err(AuthError::InvalidCredentials);
        }
        for org_id in &pat.organization_ids {
            self.enforce_sso(org_id, &pat.sso_authorizations, now).await?;
        }

        let user = self
            .identities
            .find_user(&pat.owner_id)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        let requested = headers
            .get(ORGANIZATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim);
        let active = requested
            .and_then(|r| pat.organization_ids.iter().find(|o| o.as_str() == r))
            .unwrap_or(&pat.organization_ids[0])
            .clone();

        self.stamp_last_used(pat.id.clone());
        Ok(AuthenticatedPrincipal {
            subject_id: user.id,
            subject_name: user.display_name,
            subject_email: user.email,
            organization_id: active,
            organization_ids: pat.organization_ids,
            authentication_type: AuthenticationType::Pat,
            is_system_admin: user.is_system_admin,
        })
    }

    async fn authenticate_api_token(&self, token: &str) -> Result<AuthenticatedPrincipal, AuthError> {
        let api = self
            .identities
            .find_api_token(&opaque::hash_token(token))
            .await?
            .ok_or(AuthError::InvalidCredentials)?;
        self.confirm(token, &api.encrypted_token, &api.id)?;

        let now = Utc::now();
        check_expiry(api.expires_at, now)?;
        self.enforce_sso(&api.owner_id, &api.sso_authorizations, now).await?;

        self.stamp_last_used(api.id.clone());
        Ok(AuthenticatedPrincipal {
            subject_id: api.id,
            subject_name: api.name,
            subject_email: String::new(),
            organization_id: api.owner_id.clone(),
            organization_ids: vec![api.owner_id],
            authentication_type: AuthenticationType::ApiToken,
            is_system_admin: false,
        })
    }

    fn confirm(&self, token: &str, encrypted: &str, token_id: &str) -> Result<(), AuthError> {
        match opaque::confirm(token, encrypted, &self.envelope) {
            Ok(true) => Ok(()),
            Ok(false) => Err(AuthError::InvalidCredentials),
            Err(e) => {
                tracing::warn!(
                    token_id = %token_id,
                    token_fingerprint = %crypto::fingerprint(token),
                    error = %e,
                    "stored token could not be opened"
                );
                Err(AuthError::InvalidCredentials)
            }
        }
    }

    async fn enforce_sso(
        &self,
        org_id: &str,
        auths: &SsoAuthorizations,
        now: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        let enforced = self
            .identities
            .sso_policy(org_id)
            .await?
            .is_some_and(|p| p.identity_provider_login_enforced);
        if enforced && !sso::is_authorized(auths, org_id, now, self.options.sso_freshness) {
            return Err(AuthError::TokenSsoRequired {
                org_id: org_id.to_string(),
            });
        }
        Ok(())
    }

    fn stamp_last_used(&self, token_id: String) {
        let store = self.credentials.clone();
        tokio::spawn(async move {
            if let Err(e) = store.mark_last_used(&token_id, Utc::now()).await {
                tracing::warn!(token_id = %token_id, error = %e, "failed to stamp token last use");
            }
        });
    }

    /// Chooses between the uniform 401 and an SSO redirect. Only JWT
    /// callers whose organization enforces SSO are redirected, and never
    /// the organization's owners.
    async fn reject(&self, headers: &HeaderMap, err: AuthError) -> AuthError {
        if matches!(err, AuthError::Store(StoreError::Database(_))) {
            return err;
        }
        let presented = match bearer::from_authorization(headers) {
            Ok(Some(Credential::Bearer(t))) => Some(t),
            _ => bearer::cookie(headers, &self.options.access_cookie),
        };
        let Some(token) = presented.filter(|t| opaque::classify(t) == TokenShape::Unknown) else {
            return err;
        };
        let Ok(claims) = self.validator.inspect(&token).await else {
            return err;
        };

        let enforced = matches!(
            self.identities.sso_policy(&claims.org_id).await,
            Ok(Some(p)) if p.identity_provider_login_enforced
        );
        if !enforced {
            return err;
        }
        let role = self
            .identities
            .membership_role(&claims.user_id, &claims.org_id)
            .await
            .ok()
            .flatten();
        if role == Some(OrgRole::Owner) {
            return err;
        }
        tracing::debug!(org_id = %claims.org_id, reason = %err, "redirecting to sso login");
        AuthError::SsoRedirect {
            org_id: claims.org_id,
        }
    }

    fn set_session_cookies(&self, response: &mut Response, pair: &TokenPair) {
        let now = Utc::now();
        let cookies = [
            (&self.options.access_cookie, &pair.access_token, pair.expires_at),
            (&self.options.refresh_cookie, &pair.refresh_token, pair.refresh_expires_at),
        ];
        for (name, value, expires_at) in cookies {
            let max_age = (expires_at - now).num_seconds();
            if let Some(v) = bearer::session_cookie(name, value, max_age, self.options.cookie_secure) {
                response.headers_mut().append(header::SET_COOKIE, v);
            }
        }
    }
}

fn check_expiry(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Result<(), AuthError> {
    match expires_at {
        Some(at) if at <= now => Err(AuthError::ExpiredCredentials),
        _ => Ok(()),
    }
}

/// Authentication middleware. Attaches an [`AuthenticatedPrincipal`] or
/// rejects the request.
pub async fn authenticate(
    State(auth): State<Arc<Authenticator>>,
    mut req: Request,
    next: Next,
) -> Response {
    if let Some(skipper) = &auth.options.skipper {
        if skipper(&req) {
            return next.run(req).await;
        }
    }

    let session = match auth.resolve(req.headers()).await {
        Ok(Some(session)) => session,
        Ok(None) => return next.run(req).await,
        Err(err) => {
            let err = auth.reject(req.headers(), err).await;
            return AppError::from(err).into_response();
        }
    };

    let (principal, original) =
        match admin::overlay(auth.identities.as_ref(), session.principal, req.headers()).await {
            Ok(swapped) => swapped,
            Err(err) => return AppError::from(err).into_response(),
        };
    if let Some(original) = original {
        req.extensions_mut().insert(original);
    }
    tracing::debug!(
        subject_id = %principal.subject_id,
        organization_id = %principal.organization_id,
        authentication_type = ?principal.authentication_type,
        "request authenticated"
    );
    req.extensions_mut().insert(principal);

    let mut response = next.run(req).await;
    if let Some(pair) = &session.refreshed {
        auth.set_session_cookies(&mut response, pair);
    }
    response
}
