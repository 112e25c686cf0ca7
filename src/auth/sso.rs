use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::store::SsoAuthorizations;

/// Whether `auths` holds a fresh sign-on for `org_id`. A zero window
/// accepts any recorded timestamp.
pub fn is_authorized(
    auths: &SsoAuthorizations,
    org_id: &str,
    now: DateTime<Utc>,
    freshness: Duration,
) -> bool {
    let Some(at) = auths.get(org_id) else {
        return false;
    };
    if freshness.is_zero() {
        return true;
    }
    match chrono::Duration::from_std(freshness) {
        Ok(window) => now.signed_duration_since(*at) <= window,
        Err(_) => true,
    }
}
