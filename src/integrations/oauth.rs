//! OAuth 2.0 / OIDC plumbing: authorize URL construction, state handling,
//! code exchange, refresh and userinfo.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;
use serde_json::{Map, Value};
use subtle::ConstantTimeEq;
use tokio::time::Instant;

use super::types::{AuthContext, AuthSession, OAuthSpec, OAuthToken, ProviderType};
use super::IntegrationError;

pub const STATE_BYTES: usize = 32;

/// Resolves `client_id_ref` / `client_secret_ref` names to values.
pub type SecretResolver = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

pub fn env_secrets() -> SecretResolver {
    Arc::new(|name: &str| std::env::var(name).ok().filter(|v| !v.is_empty()))
}

/// Random, URL-safe state value for one authorization round trip.
pub fn generate_state() -> String {
    let mut bytes = [0u8; STATE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn states_match(expected: &str, presented: &str) -> bool {
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}

#[derive(Clone)]
pub struct OAuthClient {
    spec: OAuthSpec,
    client_id: String,
    client_secret: String,
}

impl std::fmt::Debug for OAuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthClient")
            .field("authorize_url", &self.spec.authorize_url)
            .field("token_url", &self.spec.token_url)
            .field("client_id", &self.client_id)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

impl OAuthClient {
    pub fn from_spec(spec: &OAuthSpec, secrets: &SecretResolver) -> Result<Self, IntegrationError> {
        let client_id = secrets(&spec.client_id_ref).ok_or_else(|| {
            IntegrationError::Builder(format!("oauth client id {} is not configured", spec.client_id_ref))
        })?;
        let client_secret = secrets(&spec.client_secret_ref).ok_or_else(|| {
            IntegrationError::Builder(format!(
                "oauth client secret {} is not configured",
                spec.client_secret_ref
            ))
        })?;
        Ok(Self {
            spec: spec.clone(),
            client_id,
            client_secret,
        })
    }

    pub fn spec(&self) -> &OAuthSpec {
        &self.spec
    }

    pub fn begin_auth(
        &self,
        provider_type: &ProviderType,
        ctx: &AuthContext,
    ) -> Result<AuthSession, IntegrationError> {
        let state = generate_state();
        let mut scopes = self.spec.scopes.clone();
        for s in &ctx.scopes {
            if !scopes.contains(s) {
                scopes.push(s.clone());
            }
        }

        let mut url = url::Url::parse(&self.spec.authorize_url)
            .map_err(|e| IntegrationError::Builder(format!("authorize_url: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", &ctx.redirect_uri)
            .append_pair("state", &state);
        if !scopes.is_empty() {
            url.query_pairs_mut().append_pair("scope", &scopes.join(" "));
        }

        Ok(AuthSession {
            provider_type: provider_type.clone(),
            state,
            authorize_url: url.to_string(),
        })
    }

    pub async fn exchange_code(
        &self,
        http: &reqwest::Client,
        code: &str,
        redirect_uri: &str,
    ) -> Result<OAuthToken, IntegrationError> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        tracing::debug!(token_url = %self.spec.token_url, "exchanging authorization code");
        self.token_request(http, &form, None).await
    }

    pub async fn refresh(
        &self,
        http: &reqwest::Client,
        refresh_token: &str,
    ) -> Result<OAuthToken, IntegrationError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        tracing::debug!(token_url = %self.spec.token_url, "refreshing oauth token");
        self.token_request(http, &form, Some(refresh_token)).await
    }

    async fn token_request(
        &self,
        http: &reqwest::Client,
        form: &[(&str, &str)],
        previous_refresh: Option<&str>,
    ) -> Result<OAuthToken, IntegrationError> {
        let response = http
            .post(&self.spec.token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(IntegrationError::Transport(format!(
                "token endpoint returned {}",
                status
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| IntegrationError::Transport(format!("token response: {}", e)))?;
        if body.access_token.trim().is_empty() {
            return Err(IntegrationError::AccessTokenEmpty);
        }

        let scopes = body
            .scope
            .map(|s| {
                s.split(|c: char| c == ' ' || c == ',')
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_else(|| self.spec.scopes.clone());

        Ok(OAuthToken {
            access_token: body.access_token,
            refresh_token: body
                .refresh_token
                .or_else(|| previous_refresh.map(str::to_string)),
            expires_at: body
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
            token_type: body.token_type.unwrap_or_else(|| "Bearer".to_string()),
            scopes,
        })
    }
}

/// Fetches the OIDC userinfo document with the freshly issued token.
pub async fn fetch_userinfo(
    http: &reqwest::Client,
    url: &str,
    token: &OAuthToken,
) -> Result<Map<String, Value>, IntegrationError> {
    let response = http
        .get(url)
        .bearer_auth(&token.access_token)
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        return Err(IntegrationError::Transport(format!("userinfo returned {}", status)));
    }
    match response
        .json::<Value>()
        .await
        .map_err(|e| IntegrationError::Transport(format!("userinfo response: {}", e)))?
    {
        Value::Object(map) => Ok(map),
        _ => Err(IntegrationError::Transport("userinfo response is not an object".into())),
    }
}

// ── Pending auth sessions ──────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PendingAuth {
    pub tenant_id: String,
    pub subject_id: String,
    pub redirect_uri: String,
    state: String,
    started: Instant,
}

/// Authorization rounds in flight, one per `(tenant, provider)`.
pub struct AuthSessionStore {
    pending: DashMap<(String, ProviderType), PendingAuth>,
    ttl: Duration,
}

impl AuthSessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            ttl,
        }
    }

    pub fn remember(&self, ctx: &AuthContext, session: &AuthSession) {
        self.pending.insert(
            (ctx.tenant_id.clone(), session.provider_type.clone()),
            PendingAuth {
                tenant_id: ctx.tenant_id.clone(),
                subject_id: ctx.subject_id.clone(),
                redirect_uri: ctx.redirect_uri.clone(),
                state: session.state.clone(),
                started: Instant::now(),
            },
        );
    }

    /// Consumes the pending round for `(tenant, provider)` when `state`
    /// matches. A mismatch also consumes it.
    pub fn take(
        &self,
        tenant_id: &str,
        provider_type: &ProviderType,
        state: &str,
    ) -> Result<PendingAuth, IntegrationError> {
        let (_, pending) = self
            .pending
            .remove(&(tenant_id.to_string(), provider_type.clone()))
            .ok_or(IntegrationError::StateMismatch)?;
        if pending.started.elapsed() > self.ttl {
            return Err(IntegrationError::StateMismatch);
        }
        if !states_match(&pending.state, state) {
            tracing::warn!(tenant_id = %tenant_id, provider = %provider_type, "oauth state mismatch");
            return Err(IntegrationError::StateMismatch);
        }
        Ok(pending)
    }
}

impl Default for AuthSessionStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}
