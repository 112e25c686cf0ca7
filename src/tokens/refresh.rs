use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;

use super::{TokenError, TokenManager, TokenPair, TokenValidator};

/// Swaps a refresh token for a new pair and revokes it.
///
/// Consumed `jti`s are remembered until the token's own expiry, so replaying
/// a rotated refresh token fails verification.
pub struct TokenRefresher {
    manager: Arc<TokenManager>,
    validator: Arc<dyn TokenValidator>,
    consumed: DashMap<String, i64>,
}

impl TokenRefresher {
    pub fn new(manager: Arc<TokenManager>, validator: Arc<dyn TokenValidator>) -> Self {
        Self {
            manager,
            validator,
            consumed: DashMap::new(),
        }
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, TokenError> {
        let claims = self.validator.verify_refresh(refresh_token).await?;
        if claims.jti.is_empty() {
            return Err(TokenError::MalformedToken);
        }

        self.purge_expired();
        // `insert` returns the previous value: a hit means this jti was already spent.
        if self.consumed.insert(claims.jti.clone(), claims.exp).is_some() {
            tracing::warn!(
                user_id = %claims.user_id,
                org_id = %claims.org_id,
                jti = %claims.jti,
                "refresh token reuse rejected"
            );
            return Err(TokenError::Revoked);
        }

        self.manager
            .create_token_pair(&claims.user_id, &claims.org_id, claims.scopes)
    }

    pub fn is_revoked(&self, jti: &str) -> bool {
        self.consumed.contains_key(jti)
    }

    fn purge_expired(&self) {
        let now = Utc::now().timestamp();
        self.consumed.retain(|_, exp| *exp > now);
    }
}
