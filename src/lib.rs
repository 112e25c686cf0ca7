//! Authentication core and integration credential service.
//!
//! The binary in `main.rs` wires these modules together; integration tests
//! in `tests/` build the same router over in-memory stores.

pub mod api;
pub mod auth;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod features;
pub mod integrations;
pub mod store;
pub mod tokens;

use std::sync::Arc;

use auth::{AuthOptions, Authenticator};
use crypto::Envelope;
use features::{FeatureCache, SetStore};
use integrations::catalog::Catalog;
use integrations::oauth::AuthSessionStore;
use integrations::{ClientPool, OperationRunner};
use store::{CredentialStore, CredentialVault, IdentityStore, TemplateStore};
use tokens::{TokenManager, TokenRefresher, TokenValidator};

/// Shared application state passed to handlers and middleware.
pub struct AppState {
    pub config: config::Config,
    pub tokens: Arc<TokenManager>,
    pub refresher: Arc<TokenRefresher>,
    pub authenticator: Arc<Authenticator>,
    pub identities: Arc<dyn IdentityStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub templates: Arc<dyn TemplateStore>,
    pub vault: CredentialVault,
    pub runner: OperationRunner,
    pub auth_sessions: AuthSessionStore,
    pub features: Arc<FeatureCache>,
    pub http: reqwest::Client,
}

impl AppState {
    /// Wires the services over one backing store that implements every
    /// store trait.
    #[allow(clippy::too_many_arguments)]
    pub fn assemble<S>(
        config: config::Config,
        tokens: Arc<TokenManager>,
        validator: Arc<dyn TokenValidator>,
        store: Arc<S>,
        envelope: Envelope,
        catalog: Catalog,
        feature_store: Arc<dyn SetStore>,
        http: reqwest::Client,
    ) -> Self
    where
        S: IdentityStore + CredentialStore + TemplateStore + 'static,
    {
        let identities: Arc<dyn IdentityStore> = store.clone();
        let credentials: Arc<dyn CredentialStore> = store.clone();
        let templates: Arc<dyn TemplateStore> = store;

        let refresher = Arc::new(TokenRefresher::new(tokens.clone(), validator.clone()));
        let options = AuthOptions {
            sso_freshness: config.sso_freshness,
            cookie_secure: config.cookie_secure,
            skipper: Some(Arc::new(|req: &axum::extract::Request| {
                req.method() == axum::http::Method::OPTIONS
            })),
            ..AuthOptions::default()
        };
        let authenticator = Authenticator::new(
            options,
            validator,
            identities.clone(),
            credentials.clone(),
            envelope.clone(),
        )
        .with_reauthenticator(refresher.clone());

        let vault = CredentialVault::new(credentials.clone(), envelope);
        let pool = Arc::new(ClientPool::new(config.pool_max_size, config.pool_ttl));
        let runner = OperationRunner::new(
            Arc::new(catalog),
            vault.clone(),
            templates.clone(),
            pool,
            http.clone(),
        );
        let features = Arc::new(FeatureCache::new(feature_store, config.feature_ttl));

        Self {
            config,
            tokens,
            refresher,
            authenticator: Arc::new(authenticator),
            identities,
            credentials,
            templates,
            vault,
            runner,
            auth_sessions: AuthSessionStore::default(),
            features,
            http,
        }
    }
}
