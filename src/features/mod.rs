//! Per-tenant enabled-module cache and the module gate built on it.

pub mod backend;
pub mod gate;

pub use backend::{MemorySetStore, RedisSetStore, SetStore};
pub use gate::{require_module, FeatureAnnotation, ModuleGate};

use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

fn key(tenant_id: &str) -> String {
    format!("features:{}", tenant_id)
}

/// Enabled modules per tenant, stored as a set under `features:<tenant>`.
#[derive(Clone)]
pub struct FeatureCache {
    store: Arc<dyn SetStore>,
    ttl: Duration,
}

impl FeatureCache {
    pub fn new(store: Arc<dyn SetStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// `None` when nothing is cached for the tenant.
    pub async fn get_modules(&self, tenant_id: &str) -> anyhow::Result<Option<Vec<String>>> {
        let members = self.store.members(&key(tenant_id)).await?;
        if members.is_empty() {
            return Ok(None);
        }
        Ok(Some(members))
    }

    /// Replaces the tenant's module set in one atomic write.
    pub async fn set_modules(&self, tenant_id: &str, modules: &[String]) -> anyhow::Result<()> {
        self.store.replace(&key(tenant_id), modules, self.ttl).await?;
        tracing::debug!(tenant_id = %tenant_id, modules = modules.len(), "cached enabled modules");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(ttl: Duration) -> FeatureCache {
        FeatureCache::new(Arc::new(MemorySetStore::default()), ttl)
    }

    #[tokio::test]
    async fn set_then_get() {
        let cache = cache(DEFAULT_TTL);
        assert_eq!(cache.get_modules("org-42").await.unwrap(), None);

        cache
            .set_modules("org-42", &["compliance".into(), "trust_center".into()])
            .await
            .unwrap();
        let mut modules = cache.get_modules("org-42").await.unwrap().unwrap();
        modules.sort();
        assert_eq!(modules, ["compliance", "trust_center"]);
    }

    #[tokio::test]
    async fn set_replaces_previous_members() {
        let cache = cache(DEFAULT_TTL);
        cache.set_modules("org-42", &["a".into(), "b".into()]).await.unwrap();
        cache.set_modules("org-42", &["c".into()]).await.unwrap();
        assert_eq!(cache.get_modules("org-42").await.unwrap().unwrap(), ["c"]);

        cache.set_modules("org-42", &[]).await.unwrap();
        assert_eq!(cache.get_modules("org-42").await.unwrap(), None);
    }

    #[tokio::test]
    async fn entries_expire() {
        let cache = cache(Duration::from_millis(20));
        cache.set_modules("org-42", &["a".into()]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get_modules("org-42").await.unwrap(), None);
    }
}
