//! In-process token store backed by a `HashMap`.
//!
//! Records are kept as JSON strings, the way a shared cache would hold
//! them, and expire after their TTL.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::{Durability, StoredPositions, TokenStore};

#[derive(Debug)]
struct Entry {
    json: String,
    expires_at: Instant,
}

/// Token store living in the current process.
///
/// Suitable for single-node deployments and tests. An optional artificial
/// latency is applied to replicated writes to model a store that confirms
/// durability slowly.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    entries: RwLock<HashMap<String, Entry>>,
    replication_latency: Duration,
}

impl MemoryTokenStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store whose [`Durability::Replicated`] writes take
    /// `latency` to confirm.
    #[must_use]
    pub fn with_replication_latency(latency: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            replication_latency: latency,
        }
    }

    /// Number of live (unexpired) keys.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    /// Returns `true` if the store holds no live keys.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<StoredPositions>> {
        let map = self.entries.read().await;
        let Some(entry) = map.get(key) else {
            return Ok(None);
        };
        if entry.expires_at <= Instant::now() {
            return Ok(None);
        }
        Ok(Some(StoredPositions::from_json(&entry.json)?))
    }

    async fn set(
        &self,
        key: &str,
        record: &StoredPositions,
        ttl: Duration,
        durability: Durability,
    ) -> anyhow::Result<()> {
        let json = record.to_json()?;
        {
            let mut map = self.entries.write().await;
            let now = Instant::now();
            map.retain(|_, e| e.expires_at > now);
            map.insert(
                key.to_string(),
                Entry {
                    json,
                    expires_at: now + ttl,
                },
            );
        }
        if durability == Durability::Replicated && !self.replication_latency.is_zero() {
            tokio::time::sleep(self.replication_latency).await;
        }
        Ok(())
    }
}
