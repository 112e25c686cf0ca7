use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair};
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::claims::{ImpersonationRequest, ImpersonationSession};
use super::jwks::{JwksCache, JwksValidator, VerifySettings};
use super::{Claims, ImpersonationClaims, Jwk, Jwks, TokenError, TokenPair};
use crate::config::Config;

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub issuer: String,
    pub audience: String,
    pub access_duration: Duration,
    pub refresh_duration: Duration,
    /// How long before the access token's `exp` the paired refresh token
    /// becomes usable.
    pub refresh_overlap: Duration,
    pub leeway: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            issuer: "http://localhost:8080".into(),
            audience: "http://localhost:8080".into(),
            access_duration: Duration::from_secs(60 * 60),
            refresh_duration: Duration::from_secs(2 * 60 * 60),
            refresh_overlap: Duration::from_secs(15 * 60),
            leeway: Duration::from_secs(30),
        }
    }
}

impl TokenConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            issuer: cfg.issuer.clone(),
            audience: cfg.audience.clone(),
            access_duration: cfg.access_ttl,
            refresh_duration: cfg.refresh_ttl,
            refresh_overlap: cfg.refresh_overlap,
            leeway: cfg.clock_skew,
        }
    }

    /// Refresh tokens carry their own audience so they fail verification
    /// anywhere but the refresh endpoint.
    pub fn refresh_audience(&self) -> String {
        format!("{}/v1/refresh", self.audience.trim_end_matches('/'))
    }

    pub fn impersonation_audience(&self) -> String {
        format!("{}/impersonation", self.audience.trim_end_matches('/'))
    }
}

struct SigningKey {
    kid: String,
    encoding: EncodingKey,
    public: Vec<u8>,
}

/// Issues EdDSA-signed tokens with a single active signing key.
pub struct TokenManager {
    config: TokenConfig,
    key: SigningKey,
}

impl TokenManager {
    /// Manager with a freshly generated, process-local key.
    pub fn generate(config: TokenConfig) -> Result<Self, TokenError> {
        let pkcs8 = Self::generate_pkcs8()?;
        Self::from_pkcs8(config, None, &pkcs8)
    }

    pub fn generate_pkcs8() -> Result<Vec<u8>, TokenError> {
        let doc = Ed25519KeyPair::generate_pkcs8(&SystemRandom::new())
            .map_err(|_| TokenError::Signing("ed25519 key generation failed".into()))?;
        Ok(doc.as_ref().to_vec())
    }

    /// Loads a PKCS#8 Ed25519 key. The kid defaults to a digest of the
    /// public key so restarts with the same key publish the same kid.
    pub fn from_pkcs8(config: TokenConfig, kid: Option<String>, pkcs8: &[u8]) -> Result<Self, TokenError> {
        let pair = Ed25519KeyPair::from_pkcs8_maybe_unchecked(pkcs8)
            .map_err(|e| TokenError::Signing(format!("invalid ed25519 key: {}", e)))?;
        let public = pair.public_key().as_ref().to_vec();
        let kid = kid.unwrap_or_else(|| hex::encode(&Sha256::digest(&public)[..8]));
        Ok(Self {
            config,
            key: SigningKey {
                kid,
                encoding: EncodingKey::from_ed_der(pkcs8),
                public,
            },
        })
    }

    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    pub fn kid(&self) -> &str {
        &self.key.kid
    }

    pub fn jwks(&self) -> Jwks {
        Jwks {
            keys: vec![Jwk {
                kty: "OKP".into(),
                kid: Some(self.key.kid.clone()),
                key_use: Some("sig".into()),
                alg: Some("EdDSA".into()),
                crv: Some("Ed25519".into()),
                x: Some(URL_SAFE_NO_PAD.encode(&self.key.public)),
            }],
        }
    }

    pub fn verify_settings(&self) -> VerifySettings {
        VerifySettings {
            issuer: self.config.issuer.clone(),
            audience: self.config.audience.clone(),
            refresh_audience: self.config.refresh_audience(),
            impersonation_audience: self.config.impersonation_audience(),
            leeway: self.config.leeway,
        }
    }

    /// Validator over this manager's own public key.
    pub fn validator(&self) -> JwksValidator {
        JwksValidator::new(Arc::new(JwksCache::local(&self.jwks())), self.verify_settings())
    }

    pub fn create_token_pair(
        &self,
        user_id: &str,
        org_id: &str,
        scopes: Vec<String>,
    ) -> Result<TokenPair, TokenError> {
        self.create_token_pair_at(user_id, org_id, scopes, Utc::now())
    }

    pub fn create_token_pair_at(
        &self,
        user_id: &str,
        org_id: &str,
        scopes: Vec<String>,
        issued_at: DateTime<Utc>,
    ) -> Result<TokenPair, TokenError> {
        let iat = issued_at.timestamp();
        let access_exp = iat + secs(self.config.access_duration);
        let refresh_exp = iat + secs(self.config.refresh_duration);

        let access = Claims {
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
            sub: user_id.to_string(),
            iat,
            nbf: iat,
            exp: access_exp,
            jti: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            org_id: org_id.to_string(),
            scopes,
        };
        let refresh = Claims {
            aud: self.config.refresh_audience(),
            nbf: access_exp - secs(self.config.refresh_overlap),
            exp: refresh_exp,
            jti: uuid::Uuid::new_v4().to_string(),
            ..access.clone()
        };

        Ok(TokenPair {
            access_token: self.sign(&access)?,
            refresh_token: self.sign(&refresh)?,
            expires_at: access.expires_at(),
            refresh_expires_at: refresh.expires_at(),
        })
    }

    pub fn create_impersonation_token(&self, req: ImpersonationRequest) -> Result<String, TokenError> {
        self.create_impersonation_token_at(req, Utc::now())
    }

    pub fn create_impersonation_token_at(
        &self,
        req: ImpersonationRequest,
        issued_at: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        Ok(self.open_impersonation_session_at(req, issued_at)?.token)
    }

    /// Signs an impersonation token and reports the session it belongs to.
    pub fn open_impersonation_session(
        &self,
        req: ImpersonationRequest,
    ) -> Result<ImpersonationSession, TokenError> {
        self.open_impersonation_session_at(req, Utc::now())
    }

    fn open_impersonation_session_at(
        &self,
        req: ImpersonationRequest,
        issued_at: DateTime<Utc>,
    ) -> Result<ImpersonationSession, TokenError> {
        let iat = issued_at.timestamp();
        let claims = ImpersonationClaims {
            iss: self.config.issuer.clone(),
            aud: self.config.impersonation_audience(),
            sub: req.target_user_id.clone(),
            iat,
            nbf: iat,
            exp: iat + secs(req.duration),
            jti: uuid::Uuid::new_v4().to_string(),
            user_id: req.target_user_id.clone(),
            org_id: req.org_id,
            impersonator_id: req.impersonator_id,
            impersonator_email: req.impersonator_email,
            target_user_id: req.target_user_id,
            target_user_email: req.target_user_email,
            kind: req.kind,
            reason: req.reason,
            session_id: uuid::Uuid::new_v4().to_string(),
            scopes: req.scopes,
        };
        Ok(ImpersonationSession {
            token: self.sign(&claims)?,
            expires_at: claims.expires_at(),
            session_id: claims.session_id,
        })
    }

    fn sign<T: Serialize>(&self, claims: &T) -> Result<String, TokenError> {
        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(self.key.kid.clone());
        jsonwebtoken::encode(&header, claims, &self.key.encoding)
            .map_err(|e| TokenError::Signing(e.to_string()))
    }
}

fn secs(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX / 2)
}
