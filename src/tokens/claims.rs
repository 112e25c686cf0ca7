use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Access and refresh token claims. Unknown claims are ignored on decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    #[serde(default)]
    pub jti: String,
    pub user_id: String,
    pub org_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
}

impl Claims {
    pub fn expires_at(&self) -> DateTime<Utc> {
        timestamp(self.exp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImpersonationType {
    Support,
    Admin,
    Job,
}

impl ImpersonationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImpersonationType::Support => "support",
            ImpersonationType::Admin => "admin",
            ImpersonationType::Job => "job",
        }
    }

    /// Scopes granted when the caller does not name any.
    pub fn default_scopes(&self) -> Vec<String> {
        let scopes: &[&str] = match self {
            ImpersonationType::Support => &["read", "debug"],
            ImpersonationType::Admin => &["*"],
            ImpersonationType::Job => &["read", "write"],
        };
        scopes.iter().map(|s| s.to_string()).collect()
    }
}

impl std::str::FromStr for ImpersonationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "support" => Ok(ImpersonationType::Support),
            "admin" => Ok(ImpersonationType::Admin),
            "job" => Ok(ImpersonationType::Job),
            other => Err(format!("invalid impersonation type {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpersonationClaims {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    #[serde(default)]
    pub jti: String,
    pub user_id: String,
    pub org_id: String,
    pub impersonator_id: String,
    #[serde(default)]
    pub impersonator_email: String,
    pub target_user_id: String,
    #[serde(default)]
    pub target_user_email: String,
    #[serde(rename = "type")]
    pub kind: ImpersonationType,
    #[serde(default)]
    pub reason: String,
    pub session_id: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl ImpersonationClaims {
    pub fn expires_at(&self) -> DateTime<Utc> {
        timestamp(self.exp)
    }
}

/// Inputs for an impersonation token.
#[derive(Debug, Clone)]
pub struct ImpersonationRequest {
    pub impersonator_id: String,
    pub impersonator_email: String,
    pub target_user_id: String,
    pub target_user_email: String,
    pub org_id: String,
    pub kind: ImpersonationType,
    pub reason: String,
    pub scopes: Vec<String>,
    pub duration: Duration,
}

/// A freshly signed impersonation token and the session it opens.
#[derive(Debug, Clone)]
pub struct ImpersonationSession {
    pub token: String,
    pub session_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_claims_are_ignored() {
        let claims: Claims = serde_json::from_value(json!({
            "iss": "i", "aud": "a", "sub": "u-7", "iat": 1, "nbf": 1, "exp": 2,
            "user_id": "u-7", "org_id": "org-42", "favourite_colour": "teal"
        }))
        .unwrap();
        assert_eq!(claims.org_id, "org-42");
        assert!(claims.scopes.is_empty());
    }

    #[test]
    fn impersonation_type_uses_wire_name() {
        let v = serde_json::to_value(ImpersonationType::Support).unwrap();
        assert_eq!(v, json!("support"));
    }
}
