use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use serde::{Deserialize, Serialize};

use super::FeatureCache;
use crate::auth::AuthenticatedPrincipal;
use crate::errors::AppError;

/// Module requirement attached to a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureAnnotation {
    #[serde(default)]
    pub modules: Vec<String>,
    /// Base resources are available to every tenant.
    #[serde(default)]
    pub base: bool,
}

impl FeatureAnnotation {
    pub fn base() -> Self {
        Self {
            modules: Vec::new(),
            base: true,
        }
    }

    pub fn modules<I, S>(modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            modules: modules.into_iter().map(Into::into).collect(),
            base: false,
        }
    }

    pub fn authorizes(&self, enabled: &[String]) -> bool {
        self.base || self.modules.iter().any(|m| enabled.contains(m))
    }
}

#[derive(Clone)]
pub struct ModuleGate {
    pub cache: Arc<FeatureCache>,
    pub annotation: FeatureAnnotation,
}

/// Rejects requests whose organization has none of the annotated modules.
pub async fn require_module(
    State(gate): State<ModuleGate>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    if gate.annotation.base {
        return Ok(next.run(req).await);
    }
    let principal = req
        .extensions()
        .get::<AuthenticatedPrincipal>()
        .ok_or(AppError::Unauthorized)?;
    let enabled = gate
        .cache
        .get_modules(&principal.organization_id)
        .await?
        .unwrap_or_default();
    if !gate.annotation.authorizes(&enabled) {
        tracing::debug!(
            organization_id = %principal.organization_id,
            required = ?gate.annotation.modules,
            "module not enabled for organization"
        );
        return Err(AppError::ModuleNoAccess);
    }
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_or_intersection_authorizes() {
        let enabled = vec!["compliance".to_string()];
        assert!(FeatureAnnotation::base().authorizes(&[]));
        assert!(FeatureAnnotation::modules(["compliance", "policy"]).authorizes(&enabled));
        assert!(!FeatureAnnotation::modules(["trust_center"]).authorizes(&enabled));
        assert!(!FeatureAnnotation::modules(Vec::<String>::new()).authorizes(&enabled));
    }
}
