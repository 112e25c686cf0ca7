//! Request authentication.
//!
//! [`middleware::authenticate`] turns a bearer (JWT, personal access token
//! or API token) into an [`AuthenticatedPrincipal`] request extension,
//! enforcing tenant SSO policy on the way. Impersonation and system-admin
//! overlays run on top of that principal.

pub mod admin;
pub mod bearer;
pub mod impersonation;
pub mod middleware;
pub mod opaque;
pub mod principal;
pub mod sso;

pub use middleware::{AuthOptions, Authenticator, Reauthenticator};
pub use principal::{
    AuthenticatedPrincipal, AuthenticationType, ImpersonatedPrincipal, OriginalAdmin,
};

use thiserror::Error;

use crate::store::StoreError;
use crate::tokens::TokenError;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no authorization provided")]
    NoAuthorization,

    #[error("authorization header could not be parsed")]
    ParseBearer,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("credentials expired")]
    ExpiredCredentials,

    #[error("token refresh is disabled")]
    RefreshDisabled,

    #[error("token refresh timed out")]
    RefreshTimeout,

    #[error("token requires sso authorization for organization {org_id}")]
    TokenSsoRequired { org_id: String },

    #[error("sso login required for organization {org_id}")]
    SsoRedirect { org_id: String },

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
