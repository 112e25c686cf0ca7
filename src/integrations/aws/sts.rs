use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde::Deserialize;

use super::sigv4::{self, SigningParams};
use super::{AwsCredentials, AwsMetadata};
use crate::integrations::IntegrationError;

const STS_VERSION: &str = "2011-06-15";

pub fn default_endpoint(region: &str) -> String {
    format!("https://sts.{}.amazonaws.com/", region)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssumeRoleEnvelope {
    assume_role_response: AssumeRoleResponse,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssumeRoleResponse {
    assume_role_result: AssumeRoleResult,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssumeRoleResult {
    credentials: StsCredentials,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: String,
    #[serde(default)]
    expiration: Option<serde_json::Value>,
}

/// Calls `sts:AssumeRole` with the tenant's base credentials and returns the
/// temporary credentials for `meta.role_arn`.
pub async fn assume_role(
    http: &reqwest::Client,
    base: &AwsCredentials,
    meta: &AwsMetadata,
) -> Result<AwsCredentials, IntegrationError> {
    let endpoint = meta
        .sts_endpoint
        .clone()
        .unwrap_or_else(|| default_endpoint(&meta.region));

    let body = {
        let mut form = url::form_urlencoded::Serializer::new(String::new());
        form.append_pair("Action", "AssumeRole")
            .append_pair("Version", STS_VERSION)
            .append_pair("RoleArn", &meta.role_arn)
            .append_pair("RoleSessionName", &meta.session_name)
            .append_pair("DurationSeconds", &meta.session_duration_secs().to_string());
        if let Some(external_id) = &meta.external_id {
            form.append_pair("ExternalId", external_id);
        }
        form.finish()
    };

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/x-www-form-urlencoded; charset=utf-8"),
    );
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    sigv4::sign(
        &SigningParams {
            method: "POST",
            url: &endpoint,
            body: body.as_bytes(),
            credentials: base,
            region: &meta.region,
            service: "sts",
            now: Utc::now(),
        },
        &mut headers,
    )
    .map_err(|e| IntegrationError::Transport(e.to_string()))?;

    tracing::debug!(
        role_arn = %meta.role_arn,
        session_name = %meta.session_name,
        region = %meta.region,
        "assuming aws role"
    );

    let response = http.post(&endpoint).headers(headers).body(body).send().await?;
    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        return Err(IntegrationError::Transport(format!(
            "sts assume role returned {}: {}",
            status,
            detail.chars().take(256).collect::<String>()
        )));
    }

    let parsed: AssumeRoleEnvelope = response
        .json()
        .await
        .map_err(|e| IntegrationError::Transport(format!("sts response: {}", e)))?;
    let creds = parsed.assume_role_response.assume_role_result.credentials;

    Ok(AwsCredentials {
        access_key_id: creds.access_key_id,
        secret_access_key: creds.secret_access_key,
        session_token: Some(creds.session_token),
        expiration: creds.expiration.as_ref().and_then(parse_expiration),
    })
}

/// STS JSON responses carry `Expiration` as epoch seconds; accept RFC 3339 too.
fn parse_expiration(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::Number(n) => n
            .as_f64()
            .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single()),
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|d| d.with_timezone(&Utc)),
        _ => None,
    }
}
