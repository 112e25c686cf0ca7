use axum::http::{header, HeaderMap, HeaderValue};

use super::AuthError;

/// Scheme of an `Authorization` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Bearer(String),
    Impersonation(String),
}

/// Parses `Authorization`. `Ok(None)` when the header is absent.
pub fn from_authorization(headers: &HeaderMap) -> Result<Option<Credential>, AuthError> {
    let Some(raw) = headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };
    let raw = raw.to_str().map_err(|_| AuthError::ParseBearer)?.trim();
    let (scheme, token) = raw.split_once(' ').ok_or(AuthError::ParseBearer)?;
    let token = token.trim();
    if token.is_empty() || token.contains(' ') {
        return Err(AuthError::ParseBearer);
    }
    if scheme.eq_ignore_ascii_case("bearer") {
        Ok(Some(Credential::Bearer(token.to_string())))
    } else if scheme.eq_ignore_ascii_case("impersonation") {
        Ok(Some(Credential::Impersonation(token.to_string())))
    } else {
        Err(AuthError::ParseBearer)
    }
}

pub fn cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// `Set-Cookie` value for a session token.
pub fn session_cookie(name: &str, value: &str, max_age_secs: i64, secure: bool) -> Option<HeaderValue> {
    let mut cookie = format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        name,
        value,
        max_age_secs.max(0)
    );
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie).ok()
}
