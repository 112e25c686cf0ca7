use std::any::Any;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{Map, Value};

use super::config_decode::ConfigSchema;
use super::types::{CredentialPayload, OperationKind, OperationResult, ProviderType};
use super::IntegrationError;

/// A provider-specific client, type-erased so pooled entries can hold any
/// of them. Operations downcast to the concrete type they expect.
pub type SharedClient = Arc<dyn Any + Send + Sync>;

/// An operation's error, optionally with the partial result it produced.
#[derive(Debug)]
pub struct OperationFailure {
    pub result: Option<OperationResult>,
    pub error: IntegrationError,
}

impl OperationFailure {
    pub fn new(error: IntegrationError) -> Self {
        Self { result: None, error }
    }

    pub fn with_result(result: OperationResult, error: IntegrationError) -> Self {
        Self {
            result: Some(result),
            error,
        }
    }
}

impl From<IntegrationError> for OperationFailure {
    fn from(error: IntegrationError) -> Self {
        Self::new(error)
    }
}

pub type OperationFn =
    Arc<dyn Fn(OperationInput) -> BoxFuture<'static, Result<OperationResult, OperationFailure>> + Send + Sync>;

pub type ClientBuildFn =
    Arc<dyn Fn(ClientBuildContext) -> BoxFuture<'static, Result<SharedClient, IntegrationError>> + Send + Sync>;

/// What an operation receives when it runs.
#[derive(Clone)]
pub struct OperationInput {
    pub credential: CredentialPayload,
    /// Config decoded against the operation's schema.
    pub config: Map<String, Value>,
    pub client: Option<SharedClient>,
    pub http: reqwest::Client,
}

impl OperationInput {
    pub fn client_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.client.clone().and_then(|c| c.downcast::<T>().ok())
    }
}

#[derive(Clone)]
pub struct ClientBuildContext {
    pub credential: CredentialPayload,
    pub http: reqwest::Client,
}

#[derive(Clone)]
pub struct OperationDescriptor {
    pub provider_type: ProviderType,
    pub name: String,
    pub kind: OperationKind,
    pub description: String,
    pub client_name: Option<String>,
    pub run: Option<OperationFn>,
    pub config_schema: ConfigSchema,
    /// When set, the runner refuses to execute without a stored template.
    pub requires_template: bool,
}

impl OperationDescriptor {
    pub fn new(name: impl Into<String>, kind: OperationKind, run: OperationFn) -> Self {
        Self {
            provider_type: ProviderType::default(),
            name: name.into(),
            kind,
            description: String::new(),
            client_name: None,
            run: Some(run),
            config_schema: ConfigSchema::closed(),
            requires_template: false,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_client(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = Some(client_name.into());
        self
    }

    pub fn with_schema(mut self, schema: ConfigSchema) -> Self {
        self.config_schema = schema;
        self
    }

    pub fn require_template(mut self) -> Self {
        self.requires_template = true;
        self
    }

    pub fn summary(&self) -> OperationSummary {
        OperationSummary {
            name: self.name.clone(),
            kind: self.kind,
            description: self.description.clone(),
            client_name: self.client_name.clone(),
            config_schema: self.config_schema.to_json_schema(),
        }
    }
}

impl fmt::Debug for OperationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationDescriptor")
            .field("provider_type", &self.provider_type)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("client_name", &self.client_name)
            .field("has_run", &self.run.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationSummary {
    pub name: String,
    pub kind: OperationKind,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    pub config_schema: Value,
}

#[derive(Clone)]
pub struct ClientDescriptor {
    pub provider_type: ProviderType,
    pub name: String,
    pub description: String,
    pub build: Option<ClientBuildFn>,
}

impl ClientDescriptor {
    pub fn new(name: impl Into<String>, build: ClientBuildFn) -> Self {
        Self {
            provider_type: ProviderType::default(),
            name: name.into(),
            description: String::new(),
            build: Some(build),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

impl fmt::Debug for ClientDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientDescriptor")
            .field("provider_type", &self.provider_type)
            .field("name", &self.name)
            .field("has_build", &self.build.is_some())
            .finish()
    }
}

/// Drops descriptors without a run function or name and back-fills the
/// provider type. Order is preserved.
pub fn sanitize_operations(
    provider_type: &ProviderType,
    operations: Vec<OperationDescriptor>,
) -> Vec<OperationDescriptor> {
    operations
        .into_iter()
        .filter(|op| op.run.is_some() && !op.name.trim().is_empty())
        .map(|mut op| {
            if op.provider_type.is_empty() {
                op.provider_type = provider_type.clone();
            }
            op
        })
        .collect()
}

pub fn sanitize_clients(
    provider_type: &ProviderType,
    clients: Vec<ClientDescriptor>,
) -> Vec<ClientDescriptor> {
    clients
        .into_iter()
        .filter(|c| c.build.is_some() && !c.name.trim().is_empty())
        .map(|mut c| {
            if c.provider_type.is_empty() {
                c.provider_type = provider_type.clone();
            }
            c
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn noop() -> OperationFn {
        Arc::new(|_input: OperationInput| async { Ok(OperationResult::skipped("noop")) }.boxed())
    }

    #[test]
    fn sanitize_drops_incomplete_and_backfills_provider() {
        let provider = ProviderType::new("github");
        let mut no_run = OperationDescriptor::new("broken", OperationKind::Query, noop());
        no_run.run = None;
        let mut foreign = OperationDescriptor::new("c", OperationKind::Query, noop());
        foreign.provider_type = ProviderType::new("other");

        let ops = sanitize_operations(
            &provider,
            vec![
                OperationDescriptor::new("a", OperationKind::Health, noop()),
                no_run,
                OperationDescriptor::new("  ", OperationKind::Query, noop()),
                OperationDescriptor::new("b", OperationKind::Mutate, noop()),
                foreign,
            ],
        );

        let names: Vec<_> = ops.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert_eq!(ops[0].provider_type, provider);
        assert_eq!(ops[2].provider_type, ProviderType::new("other"));
    }

    #[test]
    fn sanitize_clients_drops_unnamed() {
        let build: ClientBuildFn =
            Arc::new(|_ctx: ClientBuildContext| async { Ok(Arc::new(()) as SharedClient) }.boxed());
        let clients = sanitize_clients(
            &ProviderType::new("x"),
            vec![ClientDescriptor::new("", build.clone()), ClientDescriptor::new("api", build)],
        );
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].provider_type.as_str(), "x");
    }
}
