use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

/// A key → string-set store with expiry.
#[async_trait]
pub trait SetStore: Send + Sync {
    async fn members(&self, key: &str) -> anyhow::Result<Vec<String>>;

    /// Deletes the key, adds `members` and sets the TTL as one unit.
    async fn replace(&self, key: &str, members: &[String], ttl: Duration) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct RedisSetStore {
    redis: ConnectionManager,
}

impl RedisSetStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl SetStore for RedisSetStore {
    async fn members(&self, key: &str) -> anyhow::Result<Vec<String>> {
        let mut conn = self.redis.clone();
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }

    async fn replace(&self, key: &str, members: &[String], ttl: Duration) -> anyhow::Result<()> {
        let mut conn = self.redis.clone();
        // MULTI/EXEC so readers never observe the key half-written.
        let mut pipe = redis::pipe();
        pipe.atomic().del(key).ignore();
        if !members.is_empty() {
            pipe.sadd(key, members).ignore();
            pipe.cmd("EXPIRE").arg(key).arg(ttl.as_secs().max(1)).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}

/// In-process [`SetStore`] with lazy expiry, for tests and `serve --memory`.
#[derive(Default)]
pub struct MemorySetStore {
    sets: DashMap<String, (BTreeSet<String>, Instant)>,
}

#[async_trait]
impl SetStore for MemorySetStore {
    async fn members(&self, key: &str) -> anyhow::Result<Vec<String>> {
        if let Some(entry) = self.sets.get(key) {
            if Instant::now() < entry.1 {
                return Ok(entry.0.iter().cloned().collect());
            }
            drop(entry);
            self.sets.remove(key);
        }
        Ok(Vec::new())
    }

    async fn replace(&self, key: &str, members: &[String], ttl: Duration) -> anyhow::Result<()> {
        if members.is_empty() {
            self.sets.remove(key);
            return Ok(());
        }
        let set = members.iter().cloned().collect();
        self.sets.insert(key.to_string(), (set, Instant::now() + ttl));
        Ok(())
    }
}
