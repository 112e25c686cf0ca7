use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{OnceCell, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use super::operations::SharedClient;
use super::types::{CredentialPayload, ProviderType};
use super::IntegrationError;
use crate::crypto;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    tenant_id: String,
    provider_type: ProviderType,
    client_name: String,
}

struct PoolEntry {
    fingerprint: String,
    client: OnceCell<SharedClient>,
    permits: Arc<Semaphore>,
    last_used: Mutex<Instant>,
}

impl PoolEntry {
    fn new(fingerprint: String, max_size: usize) -> Self {
        Self {
            fingerprint,
            client: OnceCell::new(),
            permits: Arc::new(Semaphore::new(max_size)),
            last_used: Mutex::new(Instant::now()),
        }
    }

    fn idle_for(&self, now: Instant) -> Duration {
        self.last_used
            .lock()
            .map(|t| now.saturating_duration_since(*t))
            .unwrap_or_default()
    }

    fn touch(&self) {
        if let Ok(mut t) = self.last_used.lock() {
            *t = Instant::now();
        }
    }
}

/// A client borrowed from the pool. The borrow slot is returned on drop.
pub struct PooledClient {
    client: SharedClient,
    _permit: OwnedSemaphorePermit,
}

impl PooledClient {
    pub fn client(&self) -> SharedClient {
        self.client.clone()
    }
}

/// Shared integration clients keyed by `(tenant, provider, client_name)`.
///
/// Each entry is built once from the credential it was checked out with and
/// admits at most `max_size` concurrent borrowers. An entry is rebuilt when
/// the credential changes or after it sits idle longer than `ttl`.
pub struct ClientPool {
    entries: DashMap<PoolKey, Arc<PoolEntry>>,
    max_size: usize,
    ttl: Duration,
}

/// Stable fingerprint of a credential payload, used to notice rotation.
pub fn credential_fingerprint(payload: &CredentialPayload) -> String {
    let encoded = serde_json::to_string(payload).unwrap_or_default();
    crypto::fingerprint(&encoded)
}

impl ClientPool {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            max_size: max_size.max(1),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Borrows the client for `key`, building it with `build` when absent.
    /// Waits for a free slot until `deadline`, then fails with `PoolExhausted`.
    pub async fn checkout<F, Fut>(
        &self,
        tenant_id: &str,
        provider_type: &ProviderType,
        client_name: &str,
        fingerprint: &str,
        deadline: Instant,
        build: F,
    ) -> Result<PooledClient, IntegrationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SharedClient, IntegrationError>>,
    {
        let key = PoolKey {
            tenant_id: tenant_id.to_string(),
            provider_type: provider_type.clone(),
            client_name: client_name.to_string(),
        };

        let entry = {
            let now = Instant::now();
            let mut slot = self
                .entries
                .entry(key)
                .or_insert_with(|| Arc::new(PoolEntry::new(fingerprint.to_string(), self.max_size)));
            if slot.fingerprint != fingerprint || slot.idle_for(now) > self.ttl {
                tracing::debug!(
                    tenant_id = %tenant_id,
                    provider = %provider_type,
                    client = %client_name,
                    "replacing pooled client"
                );
                *slot = Arc::new(PoolEntry::new(fingerprint.to_string(), self.max_size));
            }
            slot.value().clone()
        };

        let permit = tokio::time::timeout_at(deadline, entry.permits.clone().acquire_owned())
            .await
            .map_err(|_| IntegrationError::PoolExhausted)?
            .map_err(|_| IntegrationError::PoolExhausted)?;

        let client = entry.client.get_or_try_init(build).await?.clone();
        entry.touch();

        Ok(PooledClient {
            client,
            _permit: permit,
        })
    }

    /// Drops every entry for a tenant's provider.
    pub fn evict(&self, tenant_id: &str, provider_type: &ProviderType) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|k, _| !(k.tenant_id == tenant_id && &k.provider_type == provider_type));
        before - self.entries.len()
    }

    /// Waits for outstanding borrows to return, up to `deadline`, then
    /// clears the pool.
    pub async fn drain(&self, deadline: Instant) {
        let entries: Vec<Arc<PoolEntry>> = self.entries.iter().map(|e| e.value().clone()).collect();
        self.entries.clear();
        let max = self.max_size as u32;
        for entry in entries {
            if tokio::time::timeout_at(deadline, entry.permits.acquire_many(max))
                .await
                .is_err()
            {
                tracing::warn!("client pool drain deadline reached with clients still borrowed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_build(counter: Arc<AtomicUsize>) -> impl FnOnce() -> futures::future::BoxFuture<'static, Result<SharedClient, IntegrationError>> {
        move || {
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(n) as SharedClient)
            }
            .boxed()
        }
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_millis(200)
    }

    #[tokio::test]
    async fn same_key_and_credential_reuses_client() {
        let pool = ClientPool::new(2, Duration::from_secs(60));
        let builds = Arc::new(AtomicUsize::new(0));
        let provider = ProviderType::new("aws_security_hub");

        for _ in 0..3 {
            let c = pool
                .checkout("org-1", &provider, "securityhub", "fp-a", deadline(), counting_build(builds.clone()))
                .await
                .unwrap();
            drop(c);
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn changed_credential_rebuilds() {
        let pool = ClientPool::new(2, Duration::from_secs(60));
        let builds = Arc::new(AtomicUsize::new(0));
        let provider = ProviderType::new("p");

        pool.checkout("t", &provider, "c", "fp-a", deadline(), counting_build(builds.clone()))
            .await
            .unwrap();
        pool.checkout("t", &provider, "c", "fp-b", deadline(), counting_build(builds.clone()))
            .await
            .unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausted_pool_times_out() {
        let pool = ClientPool::new(1, Duration::from_secs(60));
        let builds = Arc::new(AtomicUsize::new(0));
        let provider = ProviderType::new("p");

        let held = pool
            .checkout("t", &provider, "c", "fp", deadline(), counting_build(builds.clone()))
            .await
            .unwrap();
        let err = pool
            .checkout(
                "t",
                &provider,
                "c",
                "fp",
                Instant::now() + Duration::from_millis(20),
                counting_build(builds.clone()),
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(err, IntegrationError::PoolExhausted));
        drop(held);
    }

    #[tokio::test]
    async fn evict_removes_tenant_provider_entries() {
        let pool = ClientPool::new(1, Duration::from_secs(60));
        let builds = Arc::new(AtomicUsize::new(0));
        let provider = ProviderType::new("p");
        pool.checkout("t1", &provider, "c", "fp", deadline(), counting_build(builds.clone()))
            .await
            .unwrap();
        pool.checkout("t2", &provider, "c", "fp", deadline(), counting_build(builds.clone()))
            .await
            .unwrap();
        assert_eq!(pool.evict("t1", &provider), 1);
        assert_eq!(pool.len(), 1);
    }
}
