use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Claims, ImpersonationClaims, TokenError};

// ── Types ────────────────────────────────────────────────────

/// JSON Web Key Set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

/// A single JSON Web Key. Only OKP/Ed25519 keys are usable here; other key
/// types in a fetched set are skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
}

impl Jwk {
    fn decoding_key(&self) -> Option<DecodingKey> {
        if self.kty != "OKP" || self.crv.as_deref() != Some("Ed25519") {
            return None;
        }
        if matches!(self.key_use.as_deref(), Some(u) if u != "sig") {
            return None;
        }
        DecodingKey::from_ed_components(self.x.as_deref()?).ok()
    }
}

/// Validates bearer tokens. Implemented over a [`JwksCache`]; tests and
/// the middleware only see this trait.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn verify_access(&self, token: &str) -> Result<Claims, TokenError>;

    async fn verify_refresh(&self, token: &str) -> Result<Claims, TokenError>;

    async fn verify_impersonation(&self, token: &str) -> Result<ImpersonationClaims, TokenError>;

    /// Checks signature, issuer and audience but ignores `exp`/`nbf`. Only
    /// used to decide how to answer a request that already failed.
    async fn inspect(&self, token: &str) -> Result<Claims, TokenError>;
}

// ── JWKS Cache ───────────────────────────────────────────────

struct RemoteSource {
    url: String,
    http: reqwest::Client,
}

/// Shared decoding keys, keyed by `kid`.
///
/// Readers go straight to the `DashMap`; only fetches take the refresh
/// lock, so a slow JWKS endpoint never blocks verification with a known kid.
pub struct JwksCache {
    keys: DashMap<String, DecodingKey>,
    remote: Option<RemoteSource>,
    min_refresh: Duration,
    last_fetch: Mutex<Option<Instant>>,
}

impl JwksCache {
    /// Cache over a fixed local key set.
    pub fn local(jwks: &Jwks) -> Self {
        let cache = Self {
            keys: DashMap::new(),
            remote: None,
            min_refresh: Duration::MAX,
            last_fetch: Mutex::new(None),
        };
        cache.replace(jwks);
        cache
    }

    /// Cache fed from a remote JWKS endpoint. Call [`JwksCache::refresh`]
    /// once at startup before serving traffic.
    pub fn remote(url: impl Into<String>, http: reqwest::Client, min_refresh: Duration) -> Self {
        Self {
            keys: DashMap::new(),
            remote: Some(RemoteSource {
                url: url.into(),
                http,
            }),
            min_refresh,
            last_fetch: Mutex::new(None),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Swaps in a new key set. Kids absent from `jwks` are dropped.
    pub fn replace(&self, jwks: &Jwks) -> usize {
        let mut seen = HashSet::new();
        for jwk in &jwks.keys {
            let (Some(kid), Some(key)) = (jwk.kid.clone(), jwk.decoding_key()) else {
                continue;
            };
            self.keys.insert(kid.clone(), key);
            seen.insert(kid);
        }
        self.keys.retain(|kid, _| seen.contains(kid));
        seen.len()
    }

    /// Fetches the remote key set. A no-op for local caches.
    pub async fn refresh(&self) -> Result<usize, TokenError> {
        let Some(remote) = &self.remote else {
            return Ok(self.keys.len());
        };
        let mut last = self.last_fetch.lock().await;
        // Stamp before fetching so a failing endpoint is not retried on every miss.
        *last = Some(Instant::now());

        tracing::info!(jwks_uri = %remote.url, "Fetching JWKS keys");
        let resp = remote
            .http
            .get(&remote.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| TokenError::JwksUnavailable(e.to_string()))?;
        let jwks: Jwks = resp
            .json()
            .await
            .map_err(|e| TokenError::JwksUnavailable(e.to_string()))?;

        Ok(self.replace(&jwks))
    }

    /// Refetches only if the last fetch is older than the minimum interval.
    async fn refresh_if_stale(&self) -> Result<(), TokenError> {
        if self.remote.is_none() {
            return Ok(());
        }
        let stale = match *self.last_fetch.lock().await {
            Some(at) => at.elapsed() >= self.min_refresh,
            None => true,
        };
        if stale {
            self.refresh().await?;
        }
        Ok(())
    }

    async fn key_for(&self, kid: Option<&str>) -> Result<DecodingKey, TokenError> {
        if let Some(key) = self.lookup(kid) {
            return Ok(key);
        }
        self.refresh_if_stale().await?;
        self.lookup(kid)
            .ok_or_else(|| TokenError::UnknownKey(kid.map(String::from)))
    }

    fn lookup(&self, kid: Option<&str>) -> Option<DecodingKey> {
        match kid {
            Some(kid) => self.keys.get(kid).map(|k| k.clone()),
            // A kid-less token is only acceptable against a single-key set.
            None if self.keys.len() == 1 => self.keys.iter().next().map(|e| e.value().clone()),
            None => None,
        }
    }

    /// Periodically refetches the remote set until `cancel` fires. Returns
    /// `None` for local caches.
    pub fn spawn_refresher(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        self.remote.as_ref()?;
        let cache = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(cache.min_refresh.max(Duration::from_secs(1)));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("jwks refresher stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = cache.refresh().await {
                            tracing::warn!(error = %e, "background jwks refresh failed");
                        }
                    }
                }
            }
        }))
    }
}

// ── Validation ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct VerifySettings {
    pub issuer: String,
    pub audience: String,
    pub refresh_audience: String,
    pub impersonation_audience: String,
    pub leeway: Duration,
}

/// [`TokenValidator`] over a shared [`JwksCache`].
#[derive(Clone)]
pub struct JwksValidator {
    cache: Arc<JwksCache>,
    settings: VerifySettings,
}

impl JwksValidator {
    pub fn new(cache: Arc<JwksCache>, settings: VerifySettings) -> Self {
        Self { cache, settings }
    }

    pub fn cache(&self) -> &Arc<JwksCache> {
        &self.cache
    }

    fn validation(&self, audience: &str, enforce_time: bool) -> Validation {
        let mut v = Validation::new(Algorithm::EdDSA);
        v.set_issuer(&[&self.settings.issuer]);
        v.set_audience(&[audience]);
        v.leeway = self.settings.leeway.as_secs();
        if enforce_time {
            v.validate_nbf = true;
            v.set_required_spec_claims(&["exp", "nbf", "iss", "aud", "sub"]);
        } else {
            v.validate_exp = false;
            v.validate_nbf = false;
            v.set_required_spec_claims::<&str>(&[]);
        }
        v
    }

    async fn decode<T: DeserializeOwned>(
        &self,
        token: &str,
        audience: &str,
        enforce_time: bool,
    ) -> Result<T, TokenError> {
        let header = jsonwebtoken::decode_header(token).map_err(|_| TokenError::MalformedToken)?;
        if header.alg != Algorithm::EdDSA {
            return Err(TokenError::MalformedToken);
        }
        let key = self.cache.key_for(header.kid.as_deref()).await?;
        let data = jsonwebtoken::decode::<T>(token, &key, &self.validation(audience, enforce_time))?;
        Ok(data.claims)
    }
}

#[async_trait]
impl TokenValidator for JwksValidator {
    async fn verify_access(&self, token: &str) -> Result<Claims, TokenError> {
        self.decode(token, &self.settings.audience, true).await
    }

    async fn verify_refresh(&self, token: &str) -> Result<Claims, TokenError> {
        self.decode(token, &self.settings.refresh_audience, true).await
    }

    async fn verify_impersonation(&self, token: &str) -> Result<ImpersonationClaims, TokenError> {
        self.decode(token, &self.settings.impersonation_audience, true)
            .await
    }

    async fn inspect(&self, token: &str) -> Result<Claims, TokenError> {
        match self.decode(token, &self.settings.audience, false).await {
            Err(TokenError::AudienceMismatch) => {
                self.decode(token, &self.settings.refresh_audience, false).await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::{TokenConfig, TokenManager};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn remote_cache_verifies_tokens_signed_by_published_keys() {
        let manager = TokenManager::generate(TokenConfig::default()).unwrap();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/jwks.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(manager.jwks()))
            .expect(1)
            .mount(&server)
            .await;

        let cache = Arc::new(JwksCache::remote(
            format!("{}/.well-known/jwks.json", server.uri()),
            reqwest::Client::new(),
            Duration::from_secs(300),
        ));
        assert_eq!(cache.refresh().await.unwrap(), 1);

        let validator = JwksValidator::new(cache, manager.verify_settings());
        let pair = manager.create_token_pair("u-7", "org-42", vec![]).unwrap();
        let claims = validator.verify_access(&pair.access_token).await.unwrap();
        assert_eq!(claims.user_id, "u-7");

        // A second unknown-kid lookup inside the refresh interval must not refetch.
        let other = TokenManager::generate(TokenConfig::default()).unwrap();
        let foreign = other.create_token_pair("u-1", "org-1", vec![]).unwrap();
        let err = validator.verify_access(&foreign.access_token).await.unwrap_err();
        assert!(matches!(err, TokenError::UnknownKey(_)));
    }

    #[tokio::test]
    async fn unreachable_jwks_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let cache = JwksCache::remote(server.uri(), reqwest::Client::new(), Duration::from_secs(1));
        assert!(matches!(
            cache.refresh().await,
            Err(TokenError::JwksUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn refresher_stops_on_cancel() {
        let cache = Arc::new(JwksCache::remote(
            "http://127.0.0.1:9/jwks.json",
            reqwest::Client::new(),
            Duration::from_secs(3600),
        ));
        let cancel = CancellationToken::new();
        let handle = cache.spawn_refresher(cancel.clone()).unwrap();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("refresher should exit promptly")
            .unwrap();
    }

    #[test]
    fn non_ed25519_keys_are_skipped() {
        let jwks = Jwks {
            keys: vec![Jwk {
                kty: "RSA".into(),
                kid: Some("rsa-1".into()),
                key_use: Some("sig".into()),
                alg: Some("RS256".into()),
                crv: None,
                x: None,
            }],
        };
        assert!(JwksCache::local(&jwks).is_empty());
    }
}
