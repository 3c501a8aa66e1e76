//! Persistence layer: chronology token store.
//!
//! Provides the [`TokenStore`] trait for saving and loading a client's
//! [`StoredPositions`] with a bounded TTL. The store is usually a shared
//! key/value cache; [`MemoryTokenStore`] is the in-process implementation.

pub mod memory;
pub mod models;

use std::time::Duration;

use async_trait::async_trait;

pub use memory::MemoryTokenStore;
pub use models::StoredPositions;

/// How strongly a write must be acknowledged before `set` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Return once the local node accepted the write.
    BestEffort,
    /// Return once enough replicas of the store acknowledged the write.
    Replicated,
}

/// Key/value storage for chronology records.
///
/// Eventual consistency is acceptable: a stale read only widens the wait
/// window of the next request.
#[async_trait]
pub trait TokenStore: Send + Sync + std::fmt::Debug {
    /// Loads the record stored under `key`, if present and unexpired.
    ///
    /// # Errors
    ///
    /// Returns the backend's failure.
    async fn get(&self, key: &str) -> anyhow::Result<Option<StoredPositions>>;

    /// Stores `record` under `key` for `ttl`.
    ///
    /// # Errors
    ///
    /// Returns the backend's failure.
    async fn set(
        &self,
        key: &str,
        record: &StoredPositions,
        ttl: Duration,
        durability: Durability,
    ) -> anyhow::Result<()>;
}
