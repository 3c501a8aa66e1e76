//! Read-your-writes protection across stateless requests.
//!
//! A [`ChronologyProtector`] is created per request. It lazily restores the
//! master positions the same client saved at the end of its previous
//! request, exposes them as minimum positions for replica reads, and at
//! shutdown captures the positions of every master this request wrote to
//! and persists them through a [`TokenStore`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::replication::deadline_after;

use crate::config::{CoordinatorConfig, ShutdownMode};
use crate::domain::{ClusterName, LbHandle, PositionToken, RequestInfo, TokenSet};
use crate::error::CoordinatorError;
use crate::persistence::{Durability, StoredPositions, TokenStore};

/// Timing and keying knobs for chronology protection.
#[derive(Debug, Clone)]
pub struct ChronologySettings {
    /// Lifetime of a persisted record.
    pub ttl: Duration,
    /// Bound on a synchronous persist.
    pub persist_timeout: Duration,
    /// Bound on waiting for a record as new as the client's position time.
    pub restore_wait: Duration,
    /// Store poll interval while waiting for such a record.
    pub poll_interval: Duration,
    /// Store key namespace.
    pub key_prefix: String,
}

impl From<&CoordinatorConfig> for ChronologySettings {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            ttl: config.chronology_ttl,
            persist_timeout: config.chronology_persist_timeout,
            restore_wait: config.chronology_restore_wait,
            poll_interval: config.replication_poll_interval,
            key_prefix: config.chronology_key_prefix.clone(),
        }
    }
}

/// What happened to the captured positions.
#[derive(Debug)]
pub enum PersistOutcome {
    /// Nothing was written (disabled, no-protection mode, or nothing touched).
    Skipped,
    /// The store confirmed the write.
    Stored,
    /// The write failed or timed out; the next request may read stale data.
    Failed(String),
    /// The write runs in the background.
    Deferred(JoinHandle<Result<(), String>>),
}

/// Per-request chronology state for one client.
#[derive(Debug)]
pub struct ChronologyProtector {
    store: Arc<dyn TokenStore>,
    key: String,
    settings: ChronologySettings,
    position_time: Option<DateTime<Utc>>,
    enabled: AtomicBool,
    restored: OnceCell<StoredPositions>,
    touched: Mutex<BTreeMap<String, DateTime<Utc>>>,
}

impl ChronologyProtector {
    /// Creates a protector for the client behind `request`. Nothing is read
    /// from the store until positions are first needed.
    #[must_use]
    pub fn new(
        store: Arc<dyn TokenStore>,
        request: &RequestInfo,
        settings: ChronologySettings,
    ) -> Self {
        let key = request.identity().store_key(&settings.key_prefix);
        Self {
            store,
            key,
            settings,
            position_time: request.position_time,
            enabled: AtomicBool::new(request.chronology_protection),
            restored: OnceCell::new(),
            touched: Mutex::new(BTreeMap::new()),
        }
    }

    /// Store key of this client.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns `false` once [`Self::disable`] ran or the request opted out.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Suppresses restore and capture for the rest of the request.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    /// Returns `true` once restored positions have been loaded.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.restored.initialized()
    }

    /// Positions saved by the client's previous request, loading them on
    /// first use. Empty when disabled, missing, or expired.
    pub async fn restored(&self) -> &StoredPositions {
        self.restored
            .get_or_init(|| async {
                if !self.is_enabled() {
                    return StoredPositions::default();
                }
                self.load().await
            })
            .await
    }

    /// Minimum position a replica of `cluster` must have reached before it
    /// may serve this client.
    pub async fn minimum_position_for(&self, cluster: &ClusterName) -> Option<PositionToken> {
        if !self.is_enabled() {
            return None;
        }
        self.restored().await.positions.get(cluster)
    }

    /// Records a master write on `db_name` now.
    pub fn record_touch(&self, db_name: &str) {
        self.record_touch_at(db_name, Utc::now());
    }

    /// Records a master write on `db_name` at `at`, keeping the latest time.
    pub fn record_touch_at(&self, db_name: &str, at: DateTime<Utc>) {
        self.touched
            .lock()
            .entry(db_name.to_string())
            .and_modify(|cur| *cur = (*cur).max(at))
            .or_insert(at);
    }

    /// Last write time on `db_name`, from this request or the restored
    /// record.
    pub async fn touched(&self, db_name: &str) -> Option<DateTime<Utc>> {
        if let Some(at) = self.touched.lock().get(db_name).copied() {
            return Some(at);
        }
        if !self.is_enabled() {
            return None;
        }
        self.restored().await.touched.get(db_name).copied()
    }

    /// Reads the master position of every handle whose master was written
    /// in this request. Must run after commits and before connections close.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Backend`] if a master position cannot be
    /// read, or [`CoordinatorError::AccessAfterDestroy`] for revoked handles.
    pub fn capture(&self, handles: &[LbHandle]) -> Result<TokenSet, CoordinatorError> {
        if !self.is_enabled() {
            return Ok(TokenSet::new());
        }
        let mut positions = Vec::new();
        for handle in handles {
            let balancer = handle.balancer()?;
            let server = balancer.master_server_name();
            if let Some(at) = balancer.last_master_write() {
                self.record_touch_at(&server, at);
            }
            if !self.touched.lock().contains_key(&server) {
                continue;
            }
            let position = balancer
                .master_position()
                .map_err(|e| CoordinatorError::backend(handle.cluster(), "master_position", e))?;
            if let Some(position) = position {
                positions.push((handle.cluster().clone(), position));
            }
        }
        Ok(positions.into_iter().collect())
    }

    /// Persists `positions` according to `mode`. Failures are logged and
    /// reported in the outcome, never returned as errors.
    pub async fn persist(&self, positions: TokenSet, mode: ShutdownMode) -> PersistOutcome {
        self.persist_at(positions, mode, Utc::now()).await
    }

    pub(crate) async fn persist_at(
        &self,
        positions: TokenSet,
        mode: ShutdownMode,
        now: DateTime<Utc>,
    ) -> PersistOutcome {
        if mode == ShutdownMode::NoChronologyProtection || !self.is_enabled() {
            return PersistOutcome::Skipped;
        }
        let record = StoredPositions {
            positions,
            touched: self.touched.lock().clone(),
            written_at: Some(now),
        };
        if record.is_empty() {
            return PersistOutcome::Skipped;
        }

        let store = Arc::clone(&self.store);
        let key = self.key.clone();
        let ttl = self.settings.ttl;
        match mode {
            ShutdownMode::Sync => {
                let write = write_merged(store.as_ref(), &key, record, ttl, Durability::Replicated);
                match tokio::time::timeout(self.settings.persist_timeout, write).await {
                    Ok(Ok(())) => PersistOutcome::Stored,
                    Ok(Err(e)) => {
                        tracing::warn!(
                            key = %key,
                            error = %e,
                            "failed to persist chronology positions"
                        );
                        PersistOutcome::Failed(e.to_string())
                    }
                    Err(_) => {
                        tracing::warn!(
                            key = %key,
                            timeout = ?self.settings.persist_timeout,
                            "timed out persisting chronology positions"
                        );
                        PersistOutcome::Failed("timed out".to_string())
                    }
                }
            }
            ShutdownMode::Async => PersistOutcome::Deferred(tokio::spawn(async move {
                write_merged(store.as_ref(), &key, record, ttl, Durability::BestEffort)
                    .await
                    .map_err(|e| {
                        tracing::warn!(
                            key = %key,
                            error = %e,
                            "failed to persist chronology positions"
                        );
                        e.to_string()
                    })
            })),
            ShutdownMode::NoChronologyProtection => PersistOutcome::Skipped,
        }
    }

    async fn load(&self) -> StoredPositions {
        let deadline = deadline_after(self.settings.restore_wait);
        loop {
            let now = Utc::now();
            let record = match self.store.get(&self.key).await {
                Ok(record) => record.filter(|r| !r.is_expired(now, self.settings.ttl)),
                Err(e) => {
                    tracing::warn!(
                        key = %self.key,
                        error = %e,
                        "failed to load chronology positions"
                    );
                    return StoredPositions::default();
                }
            };

            let fresh_enough = match (self.position_time, &record) {
                (None, _) => true,
                (Some(wanted), Some(r)) => r.written_at.is_some_and(|at| at >= wanted),
                (Some(wanted), None) => self.position_time_expired(wanted, now),
            };
            if fresh_enough || Instant::now() >= deadline {
                let record = record.unwrap_or_default();
                tracing::debug!(
                    key = %self.key,
                    clusters = record.positions.len(),
                    fresh_enough,
                    "chronology positions restored"
                );
                return record;
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// A position time older than the TTL refers to a record that can no
    /// longer exist.
    fn position_time_expired(&self, wanted: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        chrono::Duration::from_std(self.settings.ttl)
            .map(|ttl| now.signed_duration_since(wanted) > ttl)
            .unwrap_or(true)
    }
}

async fn write_merged(
    store: &dyn TokenStore,
    key: &str,
    record: StoredPositions,
    ttl: Duration,
    durability: Durability,
) -> Result<(), CoordinatorError> {
    let now = record.written_at.unwrap_or_else(Utc::now);
    let existing = store
        .get(key)
        .await
        .map_err(|e| CoordinatorError::Store(format!("read {key}: {e:#}")))?;
    let merged = match existing {
        Some(existing) if !existing.is_expired(now, ttl) => existing.merged_with(&record),
        _ => record,
    };
    store
        .set(key, &merged, ttl, durability)
        .await
        .map_err(|e| CoordinatorError::Store(format!("write {key}: {e:#}")))
}

/// Appends the `cpPosTime` query parameter to `url`, before any fragment.
#[must_use]
pub fn append_position_time(url: &str, time: DateTime<Utc>) -> String {
    #[allow(clippy::cast_precision_loss)]
    let secs = time.timestamp_micros() as f64 / 1_000_000.0;
    let (base, fragment) = match url.split_once('#') {
        Some((base, fragment)) => (base, Some(fragment)),
        None => (url, None),
    };
    let sep = if base.contains('?') { '&' } else { '?' };
    let mut out = format!("{base}{sep}cpPosTime={secs:.6}");
    if let Some(fragment) = fragment {
        out.push('#');
        out.push_str(fragment);
    }
    out
}
