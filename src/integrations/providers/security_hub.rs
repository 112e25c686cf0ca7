//! AWS Security Hub, reached through STS role federation.
//!
//! The tenant submits a role ARN, region and base credentials; every client
//! build assumes the role and signs `GetFindings` calls with the temporary
//! credentials.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::integrations::aws::sigv4::{self, SigningParams};
use crate::integrations::aws::{sts, AwsCredentials, AwsMetadata};
use crate::integrations::config_decode::{self, ConfigSchema, FieldSpec};
use crate::integrations::operations::{
    ClientBuildContext, ClientBuildFn, ClientDescriptor, OperationDescriptor, OperationFailure,
    OperationFn, OperationInput, SharedClient,
};
use crate::integrations::provider::AwsFederationBuilder;
use crate::integrations::types::{CredentialPayload, OperationKind, OperationResult};
use crate::integrations::IntegrationError;

pub const PROVIDER: &str = "aws_security_hub";
pub const CLIENT: &str = "aws_securityhub";
pub const OP_HEALTH: &str = "health.default";
pub const OP_COLLECT: &str = "vulnerabilities.collect";

const ALERT_TYPE_FINDING: &str = "finding";
pub const MAX_PAGE_SIZE: i64 = 100;
const DEFAULT_PAGE_SIZE: i64 = 100;
const MAX_SAMPLES: usize = 5;
pub const DEFAULT_SESSION: &str = "openlane-securityhub";

pub fn builder() -> AwsFederationBuilder {
    AwsFederationBuilder::new(DEFAULT_SESSION)
        .with_operations(operations())
        .with_clients(clients())
}

pub fn operations() -> Vec<OperationDescriptor> {
    let health: OperationFn = Arc::new(|input: OperationInput| run_health(input).boxed());
    let collect: OperationFn = Arc::new(|input: OperationInput| run_collect(input).boxed());

    vec![
        OperationDescriptor::new(OP_HEALTH, OperationKind::Health, health)
            .describe("Validate AWS Security Hub access by listing a finding.")
            .with_client(CLIENT),
        OperationDescriptor::new(OP_COLLECT, OperationKind::CollectFindings, collect)
            .describe("Collect AWS Security Hub findings for vulnerability ingestion.")
            .with_client(CLIENT)
            .with_schema(collect_schema()),
    ]
}

pub fn clients() -> Vec<ClientDescriptor> {
    let build: ClientBuildFn = Arc::new(|ctx: ClientBuildContext| {
        async move {
            let client = SecurityHubClient::connect(&ctx.http, &ctx.credential).await?;
            Ok(Arc::new(client) as SharedClient)
        }
        .boxed()
    });
    vec![ClientDescriptor::new(CLIENT, build).describe("Security Hub client using assumed-role credentials")]
}

fn collect_schema() -> ConfigSchema {
    ConfigSchema::closed()
        .field(FieldSpec::integer("page_size").describe("Optional page size override (max 100)."))
        .field(FieldSpec::integer("max_findings").describe("Optional cap on total findings returned."))
        .field(
            FieldSpec::string("severity")
                .lowercase()
                .describe("Optional severity label filter (low, medium, high, critical)."),
        )
        .field(
            FieldSpec::string("record_state")
                .uppercase()
                .describe("Optional record state filter (ACTIVE, ARCHIVED)."),
        )
        .field(
            FieldSpec::string("workflow_status")
                .uppercase()
                .describe("Optional workflow status filter (NEW, NOTIFIED, RESOLVED, SUPPRESSED)."),
        )
        .field(
            FieldSpec::boolean("include_payloads")
                .describe("Return raw finding payloads in the response (defaults to false)."),
        )
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FindingsConfig {
    page_size: i64,
    max_findings: i64,
    severity: String,
    record_state: String,
    workflow_status: String,
    include_payloads: bool,
}

// ── Client ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SecurityHubClient {
    http: reqwest::Client,
    endpoint: String,
    region: String,
    credentials: AwsCredentials,
}

#[derive(Debug, Default, Deserialize)]
pub struct FindingsPage {
    #[serde(rename = "Findings", default)]
    pub findings: Vec<Value>,
    #[serde(rename = "NextToken", default)]
    pub next_token: Option<String>,
}

impl SecurityHubClient {
    /// Assumes the tenant's role and returns a client bound to its region.
    pub async fn connect(
        http: &reqwest::Client,
        payload: &CredentialPayload,
    ) -> Result<Self, IntegrationError> {
        let meta = metadata(payload)?;
        let base = AwsCredentials::from_payload(payload)
            .ok_or_else(|| IntegrationError::MetadataMissing("access_key_id".into()))?;
        let credentials = sts::assume_role(http, &base, &meta).await?;
        let endpoint = meta
            .endpoint_url
            .clone()
            .unwrap_or_else(|| format!("https://securityhub.{}.amazonaws.com", meta.region));

        Ok(Self {
            http: http.clone(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            region: meta.region,
            credentials,
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub async fn get_findings(
        &self,
        max_results: i64,
        next_token: Option<&str>,
    ) -> Result<FindingsPage, IntegrationError> {
        let url = format!("{}/findings", self.endpoint);
        let mut body = json!({ "MaxResults": max_results });
        if let Some(token) = next_token {
            body["NextToken"] = Value::String(token.to_string());
        }
        let body = serde_json::to_vec(&body).map_err(|e| IntegrationError::Transport(e.to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        sigv4::sign(
            &SigningParams {
                method: "POST",
                url: &url,
                body: &body,
                credentials: &self.credentials,
                region: &self.region,
                service: "securityhub",
                now: Utc::now(),
            },
            &mut headers,
        )
        .map_err(|e| IntegrationError::Transport(e.to_string()))?;

        let response = self.http.post(&url).headers(headers).body(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(IntegrationError::Transport(format!(
                "securityhub GetFindings returned {}",
                status
            )));
        }
        response
            .json()
            .await
            .map_err(|e| IntegrationError::Transport(format!("securityhub response: {}", e)))
    }
}

fn metadata(payload: &CredentialPayload) -> Result<AwsMetadata, IntegrationError> {
    match payload.provider_data() {
        Some(data) if !data.is_empty() => AwsMetadata::from_provider_data(data, DEFAULT_SESSION),
        _ => Err(IntegrationError::MetadataMissing("provider_data".into())),
    }
}

/// Pooled client when the runner supplied one, otherwise a fresh connect.
async fn resolve_client(input: &OperationInput) -> Result<Arc<SecurityHubClient>, IntegrationError> {
    if let Some(client) = input.client_as::<SecurityHubClient>() {
        return Ok(client);
    }
    SecurityHubClient::connect(&input.http, &input.credential)
        .await
        .map(Arc::new)
}

fn region_details(region: &str) -> Map<String, Value> {
    let mut details = Map::new();
    details.insert("region".into(), Value::String(region.to_string()));
    details
}

fn failure(summary: &str, region: &str, error: IntegrationError) -> OperationFailure {
    let mut result = OperationResult::failed(summary, &error);
    result.details.extend(region_details(region));
    OperationFailure::with_result(result, error)
}

// ── Operations ─────────────────────────────────────────────────

async fn run_health(input: OperationInput) -> Result<OperationResult, OperationFailure> {
    let client = resolve_client(&input).await?;
    if let Err(e) = client.get_findings(1, None).await {
        return Err(failure("AWS Security Hub list findings failed", client.region(), e));
    }
    Ok(OperationResult::ok(
        format!("AWS Security Hub reachable for region {}", client.region()),
        region_details(client.region()),
    ))
}

#[derive(Debug, Serialize)]
struct AlertEnvelope {
    alert_type: &'static str,
    resource: String,
    payload: Value,
}

fn str_at<'a>(value: &'a Value, path: &[&str]) -> &'a str {
    let mut cur = value;
    for key in path {
        match cur.get(*key) {
            Some(next) => cur = next,
            None => return "",
        }
    }
    cur.as_str().unwrap_or("")
}

fn first_resource_id(finding: &Value) -> String {
    finding
        .get("Resources")
        .and_then(Value::as_array)
        .and_then(|resources| {
            resources
                .iter()
                .map(|r| str_at(r, &["Id"]))
                .find(|id| !id.is_empty())
        })
        .unwrap_or("")
        .to_string()
}

async fn run_collect(input: OperationInput) -> Result<OperationResult, OperationFailure> {
    let client = resolve_client(&input).await?;
    let cfg: FindingsConfig = config_decode::typed(&input.config)?;

    let page_size = match cfg.page_size {
        n if n <= 0 => DEFAULT_PAGE_SIZE,
        n => n.min(MAX_PAGE_SIZE),
    };
    let max_findings = cfg.max_findings.max(0) as usize;
    let severity_filter = cfg.severity.trim().to_lowercase();
    let record_state_filter = cfg.record_state.trim().to_uppercase();
    let workflow_filter = cfg.workflow_status.trim().to_uppercase();
    let capped = |total: usize| max_findings > 0 && total >= max_findings;

    let mut alerts: Vec<AlertEnvelope> = Vec::new();
    let mut total = 0usize;
    let mut severity_counts: BTreeMap<String, u64> = BTreeMap::new();
    let mut workflow_counts: BTreeMap<String, u64> = BTreeMap::new();
    let mut samples: Vec<Value> = Vec::new();
    let mut next_token: Option<String> = None;

    loop {
        let page = match client.get_findings(page_size, next_token.as_deref()).await {
            Ok(page) => page,
            Err(e) => {
                return Err(failure("AWS Security Hub findings fetch failed", client.region(), e));
            }
        };

        for finding in page.findings {
            if capped(total) {
                break;
            }

            let severity = str_at(&finding, &["Severity", "Label"]).to_lowercase();
            let record_state = str_at(&finding, &["RecordState"]).to_uppercase();
            let workflow_status = str_at(&finding, &["Workflow", "Status"]).to_uppercase();

            if !severity_filter.is_empty() && severity != severity_filter {
                continue;
            }
            if !record_state_filter.is_empty() && record_state != record_state_filter {
                continue;
            }
            if !workflow_filter.is_empty() && workflow_status != workflow_filter {
                continue;
            }

            total += 1;
            if !severity.is_empty() {
                *severity_counts.entry(severity.clone()).or_default() += 1;
            }
            if !workflow_status.is_empty() {
                *workflow_counts.entry(workflow_status.to_lowercase()).or_default() += 1;
            }
            if samples.len() < MAX_SAMPLES {
                samples.push(json!({
                    "id": str_at(&finding, &["Id"]),
                    "title": str_at(&finding, &["Title"]),
                    "severity": severity,
                    "state": record_state,
                }));
            }
            if cfg.include_payloads {
                alerts.push(AlertEnvelope {
                    alert_type: ALERT_TYPE_FINDING,
                    resource: first_resource_id(&finding),
                    payload: finding,
                });
            }
        }

        if capped(total) {
            break;
        }
        match page.next_token {
            Some(token) if !token.trim().is_empty() => next_token = Some(token),
            _ => break,
        }
    }

    let mut details = region_details(client.region());
    details.insert("alerts_total".into(), Value::from(total as u64));
    details.insert("page_size".into(), Value::from(page_size));
    details.insert("severity_counts".into(), json!(severity_counts));
    details.insert("workflow_counts".into(), json!(workflow_counts));
    details.insert("samples".into(), Value::Array(samples));
    if cfg.include_payloads {
        details.insert("alerts".into(), json!(alerts));
    }

    tracing::info!(
        region = %client.region(),
        alerts_total = total,
        "collected security hub findings"
    );

    Ok(OperationResult::ok(
        format!("Collected {} Security Hub findings", total),
        details,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::types::{CredentialKind, CredentialSet, OperationStatus};
    use wiremock::matchers::{body_partial_json, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn finding(id: &str, severity: &str, workflow: &str) -> Value {
        json!({
            "Id": id,
            "Title": format!("finding {}", id),
            "Severity": { "Label": severity },
            "RecordState": "ACTIVE",
            "Workflow": { "Status": workflow },
            "Resources": [{ "Id": "" }, { "Id": format!("arn:aws:s3:::bucket-{}", id) }]
        })
    }

    fn payload(server: &MockServer) -> CredentialPayload {
        let mut p = CredentialPayload::new(PROVIDER.into(), CredentialKind::AwsFederation);
        p.credential_set = Some(CredentialSet {
            access_key_id: Some("AKIDBASE".into()),
            secret_access_key: Some("base-secret".into()),
            session_token: None,
            provider_data: json!({
                "role_arn": "arn:aws:iam::123456789012:role/audit",
                "region": "us-east-1",
                "endpoint_url": server.uri(),
                "sts_endpoint": format!("{}/sts/", server.uri()),
            })
            .as_object()
            .cloned()
            .unwrap(),
        });
        p
    }

    async fn mount_sts(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/sts/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "AssumeRoleResponse": { "AssumeRoleResult": { "Credentials": {
                    "AccessKeyId": "ASIATEMP",
                    "SecretAccessKey": "temp-secret",
                    "SessionToken": "temp-session"
                }}}
            })))
            .mount(server)
            .await;
    }

    fn input(server: &MockServer, config: Value) -> OperationInput {
        OperationInput {
            credential: payload(server),
            config: config.as_object().cloned().unwrap(),
            client: None,
            http: reqwest::Client::new(),
        }
    }

    #[tokio::test]
    async fn collect_paginates_filters_and_counts() {
        let server = MockServer::start().await;
        mount_sts(&server).await;
        Mock::given(method("POST"))
            .and(path("/findings"))
            .and(header_exists("x-amz-security-token"))
            .and(body_partial_json(json!({ "NextToken": "page-2" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Findings": [finding("3", "CRITICAL", "NOTIFIED"), finding("4", "LOW", "NEW")]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/findings"))
            .and(body_partial_json(json!({ "MaxResults": 100 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Findings": [finding("1", "CRITICAL", "NEW"), finding("2", "HIGH", "NEW")],
                "NextToken": "page-2"
            })))
            .mount(&server)
            .await;

        let result = run_collect(input(
            &server,
            json!({ "severity": "critical", "include_payloads": true }),
        ))
        .await
        .unwrap();

        assert_eq!(result.status, OperationStatus::Ok);
        assert_eq!(result.details["alerts_total"], json!(2));
        assert_eq!(result.details["severity_counts"], json!({ "critical": 2 }));
        assert_eq!(result.details["workflow_counts"], json!({ "new": 1, "notified": 1 }));
        assert_eq!(result.details["samples"].as_array().unwrap().len(), 2);
        assert_eq!(result.details["alerts"][0]["resource"], json!("arn:aws:s3:::bucket-1"));
        assert_eq!(result.details["region"], json!("us-east-1"));
    }

    #[tokio::test]
    async fn collect_honors_max_findings_and_clamps_page_size() {
        let server = MockServer::start().await;
        mount_sts(&server).await;
        let page: Vec<Value> = (0..10).map(|i| finding(&i.to_string(), "HIGH", "NEW")).collect();
        Mock::given(method("POST"))
            .and(path("/findings"))
            .and(body_partial_json(json!({ "MaxResults": 100 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Findings": page,
                "NextToken": "more"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let result = run_collect(input(&server, json!({ "page_size": 500, "max_findings": 7 })))
            .await
            .unwrap();
        assert_eq!(result.details["alerts_total"], json!(7));
        assert_eq!(result.details["samples"].as_array().unwrap().len(), MAX_SAMPLES);
        assert!(result.details.get("alerts").is_none());
    }

    #[tokio::test]
    async fn upstream_error_is_embedded_in_failed_result() {
        let server = MockServer::start().await;
        mount_sts(&server).await;
        Mock::given(method("POST"))
            .and(path("/findings"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let failure = run_health(input(&server, json!({}))).await.unwrap_err();
        let result = failure.result.unwrap();
        assert_eq!(result.status, OperationStatus::Failed);
        assert_eq!(result.summary, "AWS Security Hub list findings failed");
        assert!(result.details["error"].as_str().unwrap().contains("503"));
        assert!(matches!(failure.error, IntegrationError::Transport(_)));
    }

    #[tokio::test]
    async fn missing_metadata_is_a_typed_error() {
        let mut credential = CredentialPayload::new(PROVIDER.into(), CredentialKind::AwsFederation);
        credential.credential_set = Some(CredentialSet::default());
        let input = OperationInput {
            credential,
            config: Map::new(),
            client: None,
            http: reqwest::Client::new(),
        };
        let failure = run_health(input).await.unwrap_err();
        assert!(failure.result.is_none());
        assert!(matches!(failure.error, IntegrationError::MetadataMissing(_)));
    }
}
