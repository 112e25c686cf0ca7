//! GitHub over OAuth: token validation and repository security alerts.
//!
//! Alerts come from three REST families (Dependabot, code scanning and
//! secret scanning). Repositories are either named in the operation config
//! or listed from `user/repos` with the caller's visibility and affiliation
//! filters.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::FutureExt;
use reqwest::header::{ACCEPT, USER_AGENT};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::integrations::config_decode::{self, ConfigSchema, FieldSpec};
use crate::integrations::operations::{OperationDescriptor, OperationFailure, OperationFn, OperationInput};
use crate::integrations::provider::{BuildContext, OAuthBuilder, Provider, ProviderBuilder};
use crate::integrations::types::{AuthType, OperationKind, OperationResult, ProviderSpec};
use crate::integrations::IntegrationError;

pub const PROVIDER: &str = "github";
pub const OP_HEALTH: &str = "health.default";
pub const OP_COLLECT: &str = "vulnerabilities.collect";

pub const DEFAULT_API_BASE_URL: &str = "https://api.github.com";
pub const MAX_PER_PAGE: i64 = 100;
const DEFAULT_PER_PAGE: i64 = 100;
const DEFAULT_ALERT_STATE: &str = "open";
const API_VERSION: &str = "2022-11-28";
const AGENT: &str = "gatehouse";

/// OAuth2 builder whose operations target `ProviderSpec::api_base_url`.
#[derive(Clone, Default)]
pub struct GitHubBuilder;

pub fn builder() -> GitHubBuilder {
    GitHubBuilder
}

impl ProviderBuilder for GitHubBuilder {
    fn auth_type(&self) -> AuthType {
        AuthType::OAuth2
    }

    fn build(&self, ctx: &BuildContext, spec: &ProviderSpec) -> Result<Option<Provider>, IntegrationError> {
        let base_url = spec
            .api_base_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .unwrap_or(DEFAULT_API_BASE_URL);
        OAuthBuilder::oauth2()
            .with_operations(operations(base_url))
            .build(ctx, spec)
    }
}

pub fn operations(base_url: &str) -> Vec<OperationDescriptor> {
    let base: Arc<str> = Arc::from(base_url.trim_end_matches('/'));
    let health_base = base.clone();
    let health: OperationFn =
        Arc::new(move |input: OperationInput| run_health(health_base.clone(), input).boxed());
    let collect: OperationFn =
        Arc::new(move |input: OperationInput| run_collect(base.clone(), input).boxed());

    vec![
        OperationDescriptor::new(OP_HEALTH, OperationKind::Health, health)
            .describe("Validate the GitHub token by fetching the authenticated user."),
        OperationDescriptor::new(OP_COLLECT, OperationKind::CollectFindings, collect)
            .describe("Collect Dependabot, code scanning and secret scanning alerts.")
            .with_schema(collect_schema()),
    ]
}

fn collect_schema() -> ConfigSchema {
    ConfigSchema::closed()
        .field(FieldSpec::string("owner").describe("Only scan repositories under this owner."))
        .field(
            FieldSpec::string_list("repositories")
                .describe("Explicit owner/name repositories; skips repository listing."),
        )
        .field(FieldSpec::integer("page_size").describe("Results per page (max 100)."))
        .field(FieldSpec::boolean("include_payloads").describe("Return raw alert payloads."))
        .field(
            FieldSpec::string_list("alert_types")
                .lowercase()
                .describe("dependabot, code_scanning, secret_scanning (all by default)."),
        )
        .field(FieldSpec::integer("max_repos").describe("Cap on repositories scanned."))
        .field(FieldSpec::string("visibility").lowercase().describe("all, public or private."))
        .field(
            FieldSpec::string("affiliation")
                .lowercase()
                .describe("owner, collaborator, organization_member (comma separated)."),
        )
        .field(FieldSpec::string("alert_state").lowercase().describe("Alert state, open by default."))
        .field(FieldSpec::string("severity").lowercase().describe("Dependabot severity filter."))
        .field(FieldSpec::string("ecosystem").lowercase().describe("Dependabot ecosystem filter."))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VulnerabilityConfig {
    owner: String,
    repositories: Vec<String>,
    page_size: i64,
    include_payloads: bool,
    alert_types: Vec<String>,
    max_repos: i64,
    visibility: String,
    affiliation: String,
    alert_state: String,
    severity: String,
    ecosystem: String,
}

impl VulnerabilityConfig {
    fn per_page(&self) -> i64 {
        match self.page_size {
            n if n <= 0 => DEFAULT_PER_PAGE,
            n => n.min(MAX_PER_PAGE),
        }
    }

    fn alert_state(&self) -> &str {
        match self.alert_state.trim() {
            "" => DEFAULT_ALERT_STATE,
            s => s,
        }
    }

    /// Repositories named in the config, qualified with `owner` when bare.
    fn named_repositories(&self) -> Vec<String> {
        let owner = self.owner.trim();
        self.repositories
            .iter()
            .map(|r| r.trim())
            .filter(|r| !r.is_empty())
            .map(|r| match (r.contains('/'), owner.is_empty()) {
                (false, false) => format!("{}/{}", owner, r),
                _ => r.to_string(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AlertKind {
    Dependabot,
    CodeScanning,
    SecretScanning,
}

impl AlertKind {
    const ALL: [AlertKind; 3] = [AlertKind::Dependabot, AlertKind::CodeScanning, AlertKind::SecretScanning];

    fn as_str(self) -> &'static str {
        match self {
            AlertKind::Dependabot => "dependabot",
            AlertKind::CodeScanning => "code_scanning",
            AlertKind::SecretScanning => "secret_scanning",
        }
    }

    /// Accepts `code-scanning`, `code scanning` and `code_scanning_alerts`.
    fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_lowercase().replace(['-', ' '], "_");
        let normalized = normalized.strip_suffix("_alerts").unwrap_or(&normalized);
        AlertKind::ALL.into_iter().find(|k| k.as_str() == normalized)
    }

    fn path(self, repo: &str) -> String {
        match self {
            AlertKind::Dependabot => format!("repos/{}/dependabot/alerts", repo),
            AlertKind::CodeScanning => format!("repos/{}/code-scanning/alerts", repo),
            AlertKind::SecretScanning => format!("repos/{}/secret-scanning/alerts", repo),
        }
    }

    fn failure_summary(self) -> &'static str {
        match self {
            AlertKind::Dependabot => "GitHub Dependabot alert collection failed",
            AlertKind::CodeScanning => "GitHub code scanning alert collection failed",
            AlertKind::SecretScanning => "GitHub secret scanning alert collection failed",
        }
    }
}

/// Requested kinds in order, deduplicated; unknown names are ignored and an
/// empty selection means all three.
fn requested_kinds(raw: &[String]) -> Vec<AlertKind> {
    let mut kinds: Vec<AlertKind> = Vec::new();
    for kind in raw.iter().filter_map(|r| AlertKind::parse(r)) {
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    if kinds.is_empty() {
        kinds = AlertKind::ALL.to_vec();
    }
    kinds
}

// ── API ────────────────────────────────────────────────────────

struct GitHubApi {
    http: reqwest::Client,
    base_url: Arc<str>,
    token: String,
}

#[derive(Debug, Default, Deserialize)]
struct RepoOwner {
    #[serde(default)]
    login: String,
}

#[derive(Debug, Default, Deserialize)]
struct RepoEntry {
    #[serde(default)]
    full_name: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    owner: RepoOwner,
}

#[derive(Debug, Deserialize)]
struct AuthenticatedUser {
    login: String,
}

impl GitHubApi {
    fn from_input(base_url: Arc<str>, input: &OperationInput) -> Result<Self, IntegrationError> {
        let token = input
            .credential
            .oauth_token
            .as_ref()
            .ok_or(IntegrationError::OAuthTokenMissing)?
            .access_token
            .trim()
            .to_string();
        if token.is_empty() {
            return Err(IntegrationError::AccessTokenEmpty);
        }
        Ok(Self {
            http: input.http.clone(),
            base_url,
            token,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T, IntegrationError> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .header(ACCEPT, "application/vnd.github+json")
            .header(USER_AGENT, AGENT)
            .header("X-GitHub-Api-Version", API_VERSION)
            .query(query)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(IntegrationError::Transport(format!("github GET {} returned {}", path, status)));
        }
        response
            .json()
            .await
            .map_err(|e| IntegrationError::Transport(format!("github {} response: {}", path, e)))
    }

    /// Walks `page=1..` until a page comes back shorter than `per_page`.
    async fn paged<T: DeserializeOwned>(
        &self,
        path: &str,
        per_page: i64,
        filters: &[(&str, String)],
    ) -> Result<Vec<T>, IntegrationError> {
        let mut out = Vec::new();
        let mut page = 1u32;
        loop {
            let mut query = filters.to_vec();
            query.push(("per_page", per_page.to_string()));
            query.push(("page", page.to_string()));
            let batch: Vec<T> = self.get(path, &query).await?;
            let short = (batch.len() as i64) < per_page;
            out.extend(batch);
            if short {
                return Ok(out);
            }
            page += 1;
        }
    }

    async fn list_repositories(&self, cfg: &VulnerabilityConfig) -> Result<Vec<String>, IntegrationError> {
        let mut filters = Vec::new();
        if !cfg.visibility.is_empty() {
            filters.push(("visibility", cfg.visibility.clone()));
        }
        if !cfg.affiliation.is_empty() {
            filters.push(("affiliation", cfg.affiliation.clone()));
        }
        let repos: Vec<RepoEntry> = self.paged("user/repos", cfg.per_page(), &filters).await?;
        Ok(repo_names(repos, cfg.owner.trim()))
    }

    async fn list_alerts(
        &self,
        kind: AlertKind,
        repo: &str,
        cfg: &VulnerabilityConfig,
    ) -> Result<Vec<Value>, IntegrationError> {
        let mut filters = vec![("state", cfg.alert_state().to_string())];
        if kind == AlertKind::Dependabot {
            if !cfg.severity.is_empty() {
                filters.push(("severity", cfg.severity.clone()));
            }
            if !cfg.ecosystem.is_empty() {
                filters.push(("ecosystem", cfg.ecosystem.clone()));
            }
        }
        let alerts: Vec<Value> = self.paged(&kind.path(repo), cfg.per_page(), &filters).await?;
        Ok(alerts.into_iter().filter(|a| !a.is_null()).collect())
    }
}

fn repo_names(repos: Vec<RepoEntry>, owner: &str) -> Vec<String> {
    let prefix = format!("{}/", owner.to_lowercase());
    repos
        .into_iter()
        .filter_map(|repo| {
            let full = match repo.full_name.is_empty() {
                false => repo.full_name,
                true if !repo.owner.login.is_empty() => format!("{}/{}", repo.owner.login, repo.name),
                true => return None,
            };
            let keep = owner.is_empty()
                || full.to_lowercase().starts_with(&prefix)
                || repo.owner.login.eq_ignore_ascii_case(owner);
            keep.then_some(full)
        })
        .collect()
}

fn repo_failure(summary: &str, repo: &str, error: IntegrationError) -> OperationFailure {
    let mut result = OperationResult::failed(summary, &error);
    result.details.insert("repository".into(), Value::String(repo.to_string()));
    OperationFailure::with_result(result, error)
}

// ── Operations ─────────────────────────────────────────────────

async fn run_health(base_url: Arc<str>, input: OperationInput) -> Result<OperationResult, OperationFailure> {
    let api = GitHubApi::from_input(base_url, &input)?;
    let user: AuthenticatedUser = match api.get("user", &[]).await {
        Ok(user) => user,
        Err(e) => {
            return Err(OperationFailure::with_result(
                OperationResult::failed("GitHub user lookup failed", &e),
                e,
            ))
        }
    };
    let mut details = Map::new();
    details.insert("login".into(), Value::String(user.login.clone()));
    Ok(OperationResult::ok(format!("GitHub token valid for {}", user.login), details))
}

#[derive(Debug, Serialize)]
struct AlertEnvelope {
    alert_type: &'static str,
    resource: String,
    payload: Value,
}

async fn run_collect(base_url: Arc<str>, input: OperationInput) -> Result<OperationResult, OperationFailure> {
    let api = GitHubApi::from_input(base_url, &input)?;
    let cfg: VulnerabilityConfig = config_decode::typed(&input.config)?;
    let kinds = requested_kinds(&cfg.alert_types);

    let mut repos = cfg.named_repositories();
    if repos.is_empty() {
        repos = match api.list_repositories(&cfg).await {
            Ok(repos) => repos,
            Err(e) => {
                return Err(OperationFailure::with_result(
                    OperationResult::failed("GitHub repository listing failed", &e),
                    e,
                ))
            }
        };
    }

    if repos.is_empty() {
        let mut details = Map::new();
        details.insert("repositories".into(), Value::from(0));
        details.insert("alerts".into(), Value::from(0));
        return Ok(OperationResult::ok(
            "No repositories available for vulnerability alerts",
            details,
        ));
    }
    if cfg.max_repos > 0 {
        repos.truncate(cfg.max_repos as usize);
    }

    let mut total = 0usize;
    let mut counts: BTreeMap<&'static str, u64> = BTreeMap::new();
    let mut envelopes: Vec<AlertEnvelope> = Vec::new();

    for repo in &repos {
        for kind in &kinds {
            let batch = match api.list_alerts(*kind, repo, &cfg).await {
                Ok(batch) => batch,
                Err(e) => return Err(repo_failure(kind.failure_summary(), repo, e)),
            };
            total += batch.len();
            *counts.entry(kind.as_str()).or_default() += batch.len() as u64;
            if cfg.include_payloads {
                envelopes.extend(batch.into_iter().map(|payload| AlertEnvelope {
                    alert_type: kind.as_str(),
                    resource: repo.clone(),
                    payload,
                }));
            }
        }
    }

    let mut details = Map::new();
    details.insert("repositories_scanned".into(), Value::from(repos.len() as u64));
    details.insert("alerts_total".into(), Value::from(total as u64));
    details.insert("alert_type_counts".into(), json!(counts));
    if cfg.include_payloads {
        details.insert("alerts".into(), json!(envelopes));
    }

    tracing::info!(
        repositories = repos.len(),
        alerts_total = total,
        "collected github alerts"
    );

    Ok(OperationResult::ok(
        format!(
            "Collected {} vulnerability alerts from {} repositories",
            total,
            repos.len()
        ),
        details,
    ))
}
