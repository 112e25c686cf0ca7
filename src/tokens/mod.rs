//! Signed bearer tokens.
//!
//! [`TokenManager`] issues EdDSA-signed access/refresh pairs and
//! impersonation tokens and publishes its public keys as a JWKS document.
//! Verification goes through the [`TokenValidator`] trait so the middleware
//! works the same against local keys or a remote JWKS endpoint
//! ([`JwksCache`]).

pub mod claims;
pub mod jwks;
pub mod manager;
pub mod refresh;

pub use claims::{
    Claims, ImpersonationClaims, ImpersonationRequest, ImpersonationSession, ImpersonationType,
    TokenPair,
};
pub use jwks::{Jwk, Jwks, JwksCache, JwksValidator, TokenValidator, VerifySettings};
pub use manager::{TokenConfig, TokenManager};
pub use refresh::TokenRefresher;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token expired")]
    TokenExpired,

    #[error("token not yet valid")]
    TokenNotYetValid,

    #[error("signature invalid")]
    SignatureInvalid,

    #[error("audience mismatch")]
    AudienceMismatch,

    #[error("issuer mismatch")]
    IssuerMismatch,

    #[error("malformed token")]
    MalformedToken,

    #[error("no signing key matches kid {0:?}")]
    UnknownKey(Option<String>),

    #[error("token revoked")]
    Revoked,

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("jwks unavailable: {0}")]
    JwksUnavailable(String),
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match e.kind() {
            ErrorKind::ExpiredSignature => TokenError::TokenExpired,
            ErrorKind::ImmatureSignature => TokenError::TokenNotYetValid,
            ErrorKind::InvalidSignature => TokenError::SignatureInvalid,
            ErrorKind::InvalidAudience => TokenError::AudienceMismatch,
            ErrorKind::InvalidIssuer => TokenError::IssuerMismatch,
            _ => TokenError::MalformedToken,
        }
    }
}
