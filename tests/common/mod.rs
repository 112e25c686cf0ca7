//! Shared fixtures: one in-memory `AppState` per test, seeded with a small
//! set of users and organizations.

#![allow(dead_code)]

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tower::ServiceExt;

use gatehouse::auth::opaque;
use gatehouse::config::Config;
use gatehouse::crypto::{Envelope, Keyset};
use gatehouse::features::{MemorySetStore, SetStore};
use gatehouse::integrations::catalog::{self, BuilderRegistry, Catalog};
use gatehouse::store::memory::MemoryStore;
use gatehouse::store::{
    ApiTokenRecord, IdentityStore, OrgRole, OrganizationRecord, PersonalAccessTokenRecord,
    UserRecord,
};
use gatehouse::tokens::{
    ImpersonationRequest, ImpersonationType, TokenConfig, TokenManager, TokenPair, TokenValidator,
};
use gatehouse::{api, AppState};

pub const ORG: &str = "org-42";
pub const OTHER_ORG: &str = "org-7";
pub const USER: &str = "u-7";
pub const OWNER: &str = "u-owner";
pub const ADMIN: &str = "u-admin";

pub const SPECS: &str = r#"
providers:
  - name: aws_security_hub
    auth_type: aws_federation
    capabilities:
      supports_client_pooling: true
  - name: vanta
    auth_type: api_token
"#;

pub struct Harness {
    pub state: Arc<AppState>,
    pub store: Arc<MemoryStore>,
    pub tokens: Arc<TokenManager>,
    pub envelope: Envelope,
}

impl Harness {
    pub fn new() -> Self {
        let config = Config {
            cookie_secure: false,
            ..Config::default()
        };
        let tokens = Arc::new(TokenManager::generate(TokenConfig::from_config(&config)).unwrap());
        let validator: Arc<dyn TokenValidator> = Arc::new(tokens.validator());
        let envelope = Envelope::new(Keyset::generate());

        let store = Arc::new(MemoryStore::new());
        seed(&store);

        let specs = catalog::parse_specs(SPECS).unwrap();
        let catalog = Catalog::build(&specs, &BuilderRegistry::default()).unwrap();
        let features: Arc<dyn SetStore> = Arc::new(MemorySetStore::default());

        let state = AppState::assemble(
            config,
            tokens.clone(),
            validator,
            store.clone(),
            envelope.clone(),
            catalog,
            features,
            reqwest::Client::new(),
        );

        Self {
            state: Arc::new(state),
            store,
            tokens,
            envelope,
        }
    }

    pub fn router(&self) -> Router {
        api::router(self.state.clone())
    }

    pub async fn send(&self, req: Request<Body>) -> Response<Body> {
        self.router().oneshot(req).await.unwrap()
    }

    pub fn access_token(&self, user_id: &str, org_id: &str) -> String {
        self.tokens
            .create_token_pair(user_id, org_id, Vec::new())
            .unwrap()
            .access_token
    }

    pub fn pair_issued_at(&self, user_id: &str, org_id: &str, issued_at: DateTime<Utc>) -> TokenPair {
        self.tokens
            .create_token_pair_at(user_id, org_id, Vec::new(), issued_at)
            .unwrap()
    }

    pub fn impersonation_token(&self, scopes: &[&str]) -> String {
        self.tokens
            .create_impersonation_token(ImpersonationRequest {
                impersonator_id: ADMIN.into(),
                impersonator_email: "admin@example.com".into(),
                target_user_id: USER.into(),
                target_user_email: "u7@example.com".into(),
                org_id: ORG.into(),
                kind: ImpersonationType::Support,
                reason: "ticket 1234".into(),
                scopes: scopes.iter().map(|s| s.to_string()).collect(),
                duration: Duration::from_secs(600),
            })
            .unwrap()
    }

    /// Issues a PAT for `owner_id` and returns `(token_id, plaintext)`.
    pub async fn issue_pat(&self, owner_id: &str, orgs: &[&str]) -> (String, String) {
        let issued = opaque::issue(opaque::PAT_PREFIX, &self.envelope).unwrap();
        let id = uuid::Uuid::new_v4().to_string();
        self.store
            .insert_personal_access_token(PersonalAccessTokenRecord {
                id: id.clone(),
                owner_id: owner_id.into(),
                name: "ci".into(),
                token_hash: issued.token_hash,
                encrypted_token: issued.encrypted_token,
                expires_at: None,
                organization_ids: orgs.iter().map(|o| o.to_string()).collect(),
                sso_authorizations: Default::default(),
                last_used_at: None,
            })
            .await
            .unwrap();
        (id, issued.plaintext)
    }

    pub async fn issue_api_token(&self, org_id: &str) -> (String, String) {
        let issued = opaque::issue(opaque::API_TOKEN_PREFIX, &self.envelope).unwrap();
        let id = uuid::Uuid::new_v4().to_string();
        self.store
            .insert_api_token(ApiTokenRecord {
                id: id.clone(),
                owner_id: org_id.into(),
                name: "scanner".into(),
                token_hash: issued.token_hash,
                encrypted_token: issued.encrypted_token,
                expires_at: None,
                scopes: vec!["read".into()],
                sso_authorizations: Default::default(),
                last_used_at: None,
            })
            .await
            .unwrap();
        (id, issued.plaintext)
    }

    pub async fn enable_modules(&self, org_id: &str, modules: &[&str]) {
        let modules: Vec<String> = modules.iter().map(|m| m.to_string()).collect();
        self.state.features.set_modules(org_id, &modules).await.unwrap();
    }
}

fn seed(store: &MemoryStore) {
    let users = [
        (USER, "u7@example.com", "User Seven", false),
        (OWNER, "owner@example.com", "Org Owner", false),
        (ADMIN, "admin@example.com", "Site Admin", true),
    ];
    for (id, email, name, admin) in users {
        store.insert_user(UserRecord {
            id: id.into(),
            email: email.into(),
            display_name: name.into(),
            is_system_admin: admin,
        });
    }
    store.insert_organization(OrganizationRecord {
        id: ORG.into(),
        name: "Acme".into(),
    });
    store.insert_organization(OrganizationRecord {
        id: OTHER_ORG.into(),
        name: "Initech".into(),
    });
    store.add_membership(USER, ORG, OrgRole::Member);
    store.add_membership(USER, OTHER_ORG, OrgRole::Member);
    store.add_membership(OWNER, ORG, OrgRole::Owner);
}

pub fn bearer(method: &str, uri: &str, token: &str) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {}", token))
}

pub fn get(uri: &str, token: &str) -> Request<Body> {
    bearer("GET", uri, token).body(Body::empty()).unwrap()
}

pub fn json_request(method: &str, uri: &str, auth: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", auth)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn body_json(resp: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(&bytes).unwrap()
}

/// Log sink for asserting on emitted events.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Installs a thread-local subscriber writing into the returned sink.
pub fn capture_logs() -> (CapturedLogs, tracing::subscriber::DefaultGuard) {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (logs, guard)
}
