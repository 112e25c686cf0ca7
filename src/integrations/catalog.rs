use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;

use super::provider::{
    ApiTokenBuilder, AwsFederationBuilder, BuildContext, OAuthBuilder, Provider, ProviderBuilder,
    ProviderSummary,
};
use super::providers::{github, security_hub};
use super::types::{AuthType, ProviderSpec, ProviderSpecFile, ProviderType};
use super::IntegrationError;

/// Builders by provider name, falling back to a generic builder per auth type.
pub struct BuilderRegistry {
    named: HashMap<ProviderType, Arc<dyn ProviderBuilder>>,
    context: BuildContext,
}

impl BuilderRegistry {
    /// Registry with the built-in providers.
    pub fn new(context: BuildContext) -> Self {
        let mut registry = Self {
            named: HashMap::new(),
            context,
        };
        registry.register(security_hub::PROVIDER, security_hub::builder());
        registry.register(github::PROVIDER, github::builder());
        registry
    }

    pub fn register(&mut self, name: impl Into<ProviderType>, builder: impl ProviderBuilder + 'static) {
        self.named.insert(name.into(), Arc::new(builder));
    }

    fn builder_for(&self, spec: &ProviderSpec) -> Arc<dyn ProviderBuilder> {
        if let Some(b) = self.named.get(&spec.name) {
            return b.clone();
        }
        match spec.auth_type {
            AuthType::OAuth2 => Arc::new(OAuthBuilder::oauth2()),
            AuthType::Oidc => Arc::new(OAuthBuilder::oidc()),
            AuthType::ApiToken => Arc::new(ApiTokenBuilder::new()),
            AuthType::AwsFederation => Arc::new(AwsFederationBuilder::new(format!("openlane-{}", spec.name))),
        }
    }
}

impl Default for BuilderRegistry {
    fn default() -> Self {
        Self::new(BuildContext::default())
    }
}

/// Immutable provider map, built once at startup and shared read-only.
#[derive(Clone, Default)]
pub struct Catalog {
    providers: HashMap<ProviderType, Arc<Provider>>,
    order: Vec<ProviderType>,
}

impl Catalog {
    pub fn build(specs: &[ProviderSpec], registry: &BuilderRegistry) -> Result<Self, IntegrationError> {
        let mut catalog = Catalog::default();
        for spec in specs {
            if catalog.providers.contains_key(&spec.name) {
                return Err(IntegrationError::Builder(format!("duplicate provider {}", spec.name)));
            }
            let builder = registry.builder_for(spec);
            match builder.build(&registry.context, spec)? {
                Some(provider) => {
                    tracing::info!(
                        provider = %spec.name,
                        auth_type = %spec.auth_type,
                        operations = provider.operations().len(),
                        "registered integration provider"
                    );
                    catalog.order.push(spec.name.clone());
                    catalog.providers.insert(spec.name.clone(), Arc::new(provider));
                }
                None => {
                    tracing::warn!(provider = %spec.name, "provider spec incomplete, skipping");
                }
            }
        }
        Ok(catalog)
    }

    pub fn get(&self, provider_type: &ProviderType) -> Option<Arc<Provider>> {
        self.providers.get(provider_type).cloned()
    }

    /// Providers in spec-file order.
    pub fn list(&self) -> Vec<ProviderSummary> {
        self.order
            .iter()
            .filter_map(|p| self.providers.get(p))
            .map(|p| p.summary())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Reads a YAML provider spec file.
pub fn load_specs(path: impl AsRef<Path>) -> anyhow::Result<Vec<ProviderSpec>> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading provider specs from {}", path.display()))?;
    parse_specs(&raw).with_context(|| format!("parsing provider specs in {}", path.display()))
}

pub fn parse_specs(raw: &str) -> anyhow::Result<Vec<ProviderSpec>> {
    let file: ProviderSpecFile = serde_yaml::from_str(raw)?;
    Ok(file.providers)
}
