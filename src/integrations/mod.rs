//! Pluggable integrations.
//!
//! Providers are built once at startup from declarative [`types::ProviderSpec`]s
//! into an immutable [`catalog::Catalog`]. Each provider is one of a closed set
//! of variants ([`provider::Provider`]) exposing the same capability surface:
//! auth flow, credential minting, and a list of named operations executed by
//! the [`runner::OperationRunner`].

pub mod aws;
pub mod catalog;
pub mod config_decode;
pub mod oauth;
pub mod operations;
pub mod pool;
pub mod provider;
pub mod providers;
pub mod runner;
pub mod types;

pub use catalog::Catalog;
pub use operations::{ClientDescriptor, OperationDescriptor, OperationInput};
pub use pool::ClientPool;
pub use provider::Provider;
pub use runner::OperationRunner;

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::store::StoreError;
use types::{AuthType, ProviderType};

#[derive(Debug, Error)]
pub enum IntegrationError {
    #[error("provider {0} is not available")]
    ProviderUnavailable(ProviderType),

    #[error("operation {0} not found")]
    OperationNotFound(String),

    #[error("no credential stored for this integration")]
    CredentialNotFound,

    #[error("operation requires a stored template")]
    OperationTemplateRequired,

    #[error("operation template does not allow overrides")]
    OperationTemplateOverridesNotAllowed,

    #[error("override {0} is not allowed by the operation template")]
    OperationTemplateOverrideNotAllowed(String),

    #[error("invalid operation config: {0}")]
    ConfigDecode(String),

    #[error("required metadata missing: {0}")]
    MetadataMissing(String),

    #[error("metadata invalid: {0}")]
    MetadataInvalid(String),

    #[error("oauth token missing from credential")]
    OAuthTokenMissing,

    #[error("oauth access token is empty")]
    AccessTokenEmpty,

    #[error("api token missing from credential")]
    ApiTokenMissing,

    #[error("builder expects auth type {expected}, spec declares {actual}")]
    AuthTypeMismatch { expected: AuthType, actual: AuthType },

    #[error("provider {0} does not support interactive auth")]
    BeginAuthNotSupported(ProviderType),

    #[error("oauth state mismatch")]
    StateMismatch,

    #[error("client pool exhausted")]
    PoolExhausted,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("builder error: {0}")]
    Builder(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl From<reqwest::Error> for IntegrationError {
    fn from(e: reqwest::Error) -> Self {
        IntegrationError::Transport(e.to_string())
    }
}
