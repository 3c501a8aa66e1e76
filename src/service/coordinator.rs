//! Request-scoped coordinator over every cluster a request touches.
//!
//! [`LbCoordinator`] is the single entry point a request uses. It owns:
//!
//! - the [`LbRegistry`] of load balancer handles,
//! - the master transaction round ([`RoundTracker`]),
//! - the [`ChronologyProtector`] for the current client,
//! - the [`ReplicationWaiter`] and its [`ReplicationListeners`].
//!
//! All bulk operations take a snapshot of the active handles first and act
//! on them in registration order.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use super::chronology::{
    ChronologyProtector, ChronologySettings, PersistOutcome, append_position_time,
};
use super::listeners::{ReplicationListener, ReplicationListeners};
use super::registry::LbRegistry;
use super::replication::{ReplicationWaiter, WaitOptions};
use super::Cancellation;
use crate::config::{CoordinatorConfig, ShutdownMode};
use crate::domain::{
    ClusterName, CommitProgress, Domain, LbHandle, LbKind, LoadBalancerFactory, PositionToken,
    RequestInfo, RoundState, RoundTracker, TokenSet, TransactionTicket,
};
use crate::error::CoordinatorError;
use crate::persistence::TokenStore;

/// Options for [`LbCoordinator::commit_master_changes`].
#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
    /// Overrides the configured cumulative write-time limit.
    pub max_write_duration: Option<Duration>,
    /// Stops the commit loop between clusters.
    pub cancel: Option<Cancellation>,
}

/// Result of [`LbCoordinator::shutdown`].
#[derive(Debug)]
pub struct ShutdownReport {
    /// Master positions captured for clusters written in this request.
    pub positions: TokenSet,
    /// Time to hand to the next request (see
    /// [`LbCoordinator::append_pre_shutdown_time_as_query`]); `None` when
    /// nothing was persisted.
    pub position_time: Option<DateTime<Utc>>,
    /// What happened to the captured positions.
    pub persist: PersistOutcome,
}

/// Coordinator for one request.
///
/// # Lifecycle
///
/// ```text
/// new ─► get_main_lb / get_external_lb ─► begin_master_changes
///     ─► (writes through the handles) ─► commit_master_changes | rollback_master_changes
///     ─► shutdown ─► destroy
/// ```
///
/// After [`Self::destroy`] every operation except `destroy` itself fails
/// with [`CoordinatorError::AccessAfterDestroy`].
#[derive(Debug)]
pub struct LbCoordinator {
    id: Uuid,
    config: CoordinatorConfig,
    local_domain: RwLock<Domain>,
    registry: LbRegistry,
    round: Mutex<RoundTracker>,
    store: Arc<dyn TokenStore>,
    chronology: RwLock<Arc<ChronologyProtector>>,
    protection_disabled: AtomicBool,
    waiter: ReplicationWaiter,
    listeners: Mutex<ReplicationListeners>,
    agent: RwLock<Option<String>>,
    domain_prefix: RwLock<Option<String>>,
}

impl LbCoordinator {
    /// Creates a coordinator for the request described by `request`.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Configuration`] if `config` is invalid.
    pub fn new(
        config: CoordinatorConfig,
        factory: Arc<dyn LoadBalancerFactory>,
        store: Arc<dyn TokenStore>,
        request: &RequestInfo,
    ) -> Result<Self, CoordinatorError> {
        config.validate()?;
        let chronology = ChronologyProtector::new(
            Arc::clone(&store),
            request,
            ChronologySettings::from(&config),
        );
        Ok(Self {
            id: Uuid::new_v4(),
            local_domain: RwLock::new(config.local_domain.clone()),
            registry: LbRegistry::new(factory),
            round: Mutex::new(RoundTracker::new()),
            store,
            chronology: RwLock::new(Arc::new(chronology)),
            protection_disabled: AtomicBool::new(false),
            waiter: ReplicationWaiter::new(config.replication_poll_interval),
            listeners: Mutex::new(ReplicationListeners::new()),
            agent: RwLock::new(config.agent_name.clone()),
            domain_prefix: RwLock::new(None),
            config,
        })
    }

    /// Unique id of this coordinator; tickets are bound to it.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Configuration this coordinator runs with.
    #[must_use]
    pub const fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Domain used when callers do not name one.
    #[must_use]
    pub fn local_domain(&self) -> Domain {
        self.local_domain.read().clone()
    }

    /// Current transaction round state.
    #[must_use]
    pub fn round_state(&self) -> RoundState {
        self.round.lock().state().clone()
    }

    /// Disables every balancer and revokes all handles. Idempotent.
    pub async fn destroy(&self) {
        self.registry.destroy().await;
    }

    /// Cached main balancer for `domain` (the local domain when `None`).
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::AccessAfterDestroy`] after destroy or
    /// [`CoordinatorError::HandleCreation`] if the factory fails.
    pub async fn get_main_lb(&self, domain: Option<&Domain>) -> Result<LbHandle, CoordinatorError> {
        let domain = self.domain_or_local(domain);
        self.get_tracked(&LbKind::Main, &domain).await
    }

    /// Fresh main balancer owned by the caller. It is never part of bulk
    /// operations and gets no chronology floor.
    ///
    /// # Errors
    ///
    /// Same as [`Self::get_main_lb`].
    pub fn new_main_lb(&self, domain: Option<&Domain>) -> Result<LbHandle, CoordinatorError> {
        let domain = self.domain_or_local(domain);
        self.new_untracked(&LbKind::Main, &domain)
    }

    /// Cached balancer for the external cluster `cluster`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::get_main_lb`].
    pub async fn get_external_lb(&self, cluster: &str) -> Result<LbHandle, CoordinatorError> {
        let domain = self.local_domain();
        self.get_tracked(&LbKind::External(cluster.to_string()), &domain)
            .await
    }

    /// Fresh balancer for the external cluster `cluster`, owned by the
    /// caller.
    ///
    /// # Errors
    ///
    /// Same as [`Self::get_main_lb`].
    pub fn new_external_lb(&self, cluster: &str) -> Result<LbHandle, CoordinatorError> {
        let domain = self.local_domain();
        self.new_untracked(&LbKind::External(cluster.to_string()), &domain)
    }

    /// Snapshot of the tracked handles in registration order.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::AccessAfterDestroy`] after destroy.
    pub async fn active_handles(&self) -> Result<Vec<LbHandle>, CoordinatorError> {
        let domain = self.local_domain();
        self.registry.active(&domain).await
    }

    /// Calls `f` once per tracked handle. The set is fixed before the first
    /// call; handles `f` creates are not visited.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::AccessAfterDestroy`] after destroy, or
    /// the first error `f` returns.
    pub async fn for_each_lb<F>(&self, mut f: F) -> Result<(), CoordinatorError>
    where
        F: FnMut(&LbHandle) -> Result<(), CoordinatorError>,
    {
        for handle in &self.active_handles().await? {
            f(handle)?;
        }
        Ok(())
    }

    /// Ends open read snapshots on every tracked balancer.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Backend`] for the first balancer that
    /// fails.
    pub async fn flush_replica_snapshots(&self, caller: &str) -> Result<(), CoordinatorError> {
        for handle in self.active_handles().await? {
            handle
                .balancer()?
                .flush_replica_snapshots(caller)
                .map_err(|e| {
                    CoordinatorError::backend(handle.cluster(), "flush_replica_snapshots", e)
                })?;
        }
        Ok(())
    }

    /// Opens a transaction round on every tracked balancer.
    ///
    /// If any balancer refuses, the round is closed again on every balancer
    /// and the coordinator is left `Inactive`.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::RoundAlreadyActive`] if a round is open,
    /// or [`CoordinatorError::Backend`] if a balancer refuses.
    pub async fn begin_master_changes(&self, caller: &str) -> Result<(), CoordinatorError> {
        let handles = self.active_handles().await?;
        self.round.lock().begin(caller)?;
        if let Err(e) = Self::begin_each(caller, &handles) {
            tracing::warn!(caller, error = %e, "master round could not start");
            Self::finish_rounds(caller, &handles);
            self.round.lock().finish();
            return Err(e);
        }
        tracing::debug!(caller, handles = handles.len(), "master round started");
        Ok(())
    }

    fn begin_each(caller: &str, handles: &[LbHandle]) -> Result<(), CoordinatorError> {
        for handle in handles {
            let balancer = handle.balancer()?;
            balancer.flush_replica_snapshots(caller).map_err(|e| {
                CoordinatorError::backend(handle.cluster(), "flush_replica_snapshots", e)
            })?;
            balancer
                .begin_round(caller)
                .map_err(|e| CoordinatorError::backend(handle.cluster(), "begin_round", e))?;
        }
        Ok(())
    }

    fn finish_rounds(caller: &str, handles: &[LbHandle]) {
        for handle in handles {
            if let Ok(balancer) = handle.balancer() {
                balancer.finish_round(caller);
            }
        }
    }

    /// Commits pending writes cluster by cluster and closes the round.
    ///
    /// There is no cross-cluster atomicity. If the cumulative write time of
    /// committed clusters exceeds the limit, or `opts.cancel` fires, the
    /// remaining clusters stay uncommitted and the error lists which ones.
    /// The round is `Inactive` afterwards in every case.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::WriteDurationExceeded`],
    /// [`CoordinatorError::Cancelled`] or [`CoordinatorError::CommitFailed`],
    /// each carrying the commit progress.
    pub async fn commit_master_changes(
        &self,
        caller: &str,
        opts: CommitOptions,
    ) -> Result<(), CoordinatorError> {
        let handles = self.active_handles().await?;
        let limit = opts.max_write_duration.or(self.config.max_write_duration);

        let mut pending = Vec::new();
        for handle in &handles {
            if handle.balancer()?.has_pending_master_changes() {
                pending.push(handle);
            }
        }
        let mut progress = CommitProgress {
            committed: Vec::new(),
            not_committed: pending.iter().map(|h| h.cluster().clone()).collect(),
        };

        let chronology = self.chronology();
        let result = Self::commit_each(
            caller,
            &pending,
            limit,
            opts.cancel.as_ref(),
            &chronology,
            &mut progress,
        );

        {
            let mut round = self.round.lock();
            round.finish();
            if !progress.committed.is_empty() {
                round.record_master_write(Utc::now());
            }
        }
        Self::finish_rounds(caller, &handles);
        tracing::debug!(caller, committed = progress.committed.len(), "master round committed");
        result
    }

    fn commit_each(
        caller: &str,
        pending: &[&LbHandle],
        limit: Option<Duration>,
        cancel: Option<&Cancellation>,
        chronology: &ChronologyProtector,
        progress: &mut CommitProgress,
    ) -> Result<(), CoordinatorError> {
        let mut elapsed = Duration::ZERO;
        for handle in pending {
            if cancel.is_some_and(Cancellation::is_cancelled) {
                return Err(CoordinatorError::Cancelled {
                    operation: "commit master changes",
                    progress: Some(progress.clone()),
                });
            }
            let balancer = handle.balancer()?;
            let took = balancer.pending_write_duration();
            if let Err(source) = balancer.commit(caller) {
                tracing::warn!(caller, cluster = %handle.cluster(), %progress, "commit failed");
                return Err(CoordinatorError::CommitFailed {
                    cluster: handle.cluster().clone(),
                    progress: progress.clone(),
                    source,
                });
            }
            chronology.record_touch(&balancer.master_server_name());
            progress.not_committed.retain(|c| c != handle.cluster());
            progress.committed.push(handle.cluster().clone());
            elapsed += took;

            if let Some(limit) = limit
                && elapsed > limit
            {
                tracing::warn!(caller, ?elapsed, ?limit, %progress, "write duration exceeded");
                return Err(CoordinatorError::WriteDurationExceeded {
                    elapsed,
                    limit,
                    progress: progress.clone(),
                });
            }
        }
        Ok(())
    }

    /// Rolls back pending writes on every tracked balancer and closes the
    /// round. Individual rollback failures are logged, not returned.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::AccessAfterDestroy`] after destroy.
    pub async fn rollback_master_changes(&self, caller: &str) -> Result<(), CoordinatorError> {
        let handles = self.active_handles().await?;
        for handle in &handles {
            let Ok(balancer) = handle.balancer() else {
                continue;
            };
            if balancer.has_pending_master_changes()
                && let Err(e) = balancer.rollback(caller)
            {
                tracing::warn!(caller, cluster = %handle.cluster(), error = %e, "rollback failed");
            }
            balancer.finish_round(caller);
        }
        self.round.lock().finish();
        tracing::debug!(caller, "master round rolled back");
        Ok(())
    }

    /// Commits everything pending and flushes replica snapshots.
    ///
    /// # Errors
    ///
    /// Same as [`Self::commit_master_changes`] and
    /// [`Self::flush_replica_snapshots`].
    pub async fn commit_all(
        &self,
        caller: &str,
        opts: CommitOptions,
    ) -> Result<(), CoordinatorError> {
        self.commit_master_changes(caller, opts).await?;
        self.flush_replica_snapshots(caller).await
    }

    /// Returns `true` if any tracked balancer holds uncommitted writes.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::AccessAfterDestroy`] after destroy.
    pub async fn has_master_changes(&self) -> Result<bool, CoordinatorError> {
        for handle in self.active_handles().await? {
            if handle.balancer()?.has_pending_master_changes() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Returns `true` if any tracked balancer had to read from a lagged
    /// replica.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::AccessAfterDestroy`] after destroy.
    pub async fn lagged_replica_used(&self) -> Result<bool, CoordinatorError> {
        for handle in self.active_handles().await? {
            if handle.balancer()?.lagged_replica_used() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Returns `true` if writes are pending or a commit happened within
    /// `age` (the replication wait timeout when `None`).
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::AccessAfterDestroy`] after destroy.
    pub async fn has_or_made_recent_master_changes(
        &self,
        age: Option<Duration>,
    ) -> Result<bool, CoordinatorError> {
        if self.has_master_changes().await? {
            return Ok(true);
        }
        let age = age.unwrap_or(self.config.replication_wait_timeout);
        Ok(self.round.lock().wrote_within(Utc::now(), age))
    }

    /// Runs the registered listeners, then waits until replicas of the
    /// selected clusters reach their targets.
    ///
    /// Without a scope, every tracked cluster written in this request or
    /// carrying a restored chronology minimum is selected. The target for a
    /// cluster is the greater of its current master position (if written
    /// here) and the restored minimum. Waits run concurrently.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Listener`] if a listener fails,
    /// [`CoordinatorError::UnknownCluster`] if `opts.cluster` is not
    /// tracked, [`CoordinatorError::ReplicationWaitTimeout`] naming the
    /// first cluster that did not catch up, or
    /// [`CoordinatorError::Cancelled`].
    pub async fn wait_for_replication(&self, opts: WaitOptions) -> Result<(), CoordinatorError> {
        self.registry.ensure_live("wait for replication")?;
        let listeners = self.listeners.lock().clone();
        listeners.run()?;

        let handles = match (&opts.domain, &opts.cluster) {
            (Some(domain), _) => vec![self.get_main_lb(Some(domain)).await?],
            (None, Some(cluster)) => {
                let wanted = ClusterName::External(cluster.clone());
                let found = self
                    .active_handles()
                    .await?
                    .into_iter()
                    .find(|h| h.cluster() == &wanted);
                vec![found.ok_or_else(|| CoordinatorError::UnknownCluster(cluster.clone()))?]
            }
            (None, None) => self.active_handles().await?,
        };

        let chronology = self.chronology();
        let mut targets = Vec::new();
        for handle in handles {
            let restored = chronology.minimum_position_for(handle.cluster()).await;
            if let Some(target) = Self::wait_target(&handle, restored, opts.if_writes_since)? {
                targets.push((handle, target));
            }
        }

        let timeout = opts.timeout.unwrap_or(self.config.replication_wait_timeout);
        self.waiter
            .wait_all(&targets, timeout, opts.cancel.as_ref())
            .await
    }

    fn wait_target(
        handle: &LbHandle,
        restored: Option<PositionToken>,
        if_writes_since: Option<DateTime<Utc>>,
    ) -> Result<Option<PositionToken>, CoordinatorError> {
        let balancer = handle.balancer()?;
        let last_write = balancer.last_master_write();
        let wrote = match if_writes_since {
            Some(since) => last_write.is_some_and(|at| at > since),
            None => last_write.is_some(),
        };
        if !wrote && restored.is_none() {
            return Ok(None);
        }
        let own = if wrote {
            balancer
                .master_position()
                .map_err(|e| CoordinatorError::backend(handle.cluster(), "master_position", e))?
        } else {
            None
        };
        Ok(own.max(restored))
    }

    /// Adds, replaces or (with `None`) removes a named listener run before
    /// every replication wait, in registration order.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::AccessAfterDestroy`] after destroy.
    pub fn set_wait_for_replication_listener(
        &self,
        name: &str,
        listener: Option<ReplicationListener>,
    ) -> Result<(), CoordinatorError> {
        self.registry.ensure_live("set replication listener")?;
        self.listeners.lock().set(name, listener);
        Ok(())
    }

    /// Issues a ticket proving no writes are pending right now.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::RoundAlreadyActive`] during a round or
    /// [`CoordinatorError::PendingWrites`] if any balancer holds writes.
    pub async fn get_empty_transaction_ticket(
        &self,
        caller: &str,
    ) -> Result<TransactionTicket, CoordinatorError> {
        let handles = self.active_handles().await?;
        self.round.lock().ensure_inactive(caller)?;
        let mut pending = Vec::new();
        for handle in &handles {
            if handle.balancer()?.has_pending_master_changes() {
                pending.push(handle.cluster().clone());
            }
        }
        if !pending.is_empty() {
            return Err(CoordinatorError::PendingWrites {
                caller: caller.to_string(),
                clusters: pending,
            });
        }
        Ok(TransactionTicket::new(
            self.id,
            Utc::now(),
            Self::write_counts(&handles)?,
        ))
    }

    /// Commits and waits for replication of writes made since `ticket`.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::TicketStale`] if any tracked balancer
    /// wrote after the ticket was issued, otherwise the errors of
    /// [`Self::commit_master_changes`] and [`Self::wait_for_replication`].
    pub async fn commit_and_wait_for_replication(
        &self,
        caller: &str,
        ticket: &TransactionTicket,
        opts: WaitOptions,
    ) -> Result<(), CoordinatorError> {
        let handles = self.active_handles().await?;
        ticket.validate(self.id, &Self::write_counts(&handles)?)?;
        self.commit_master_changes(
            caller,
            CommitOptions {
                max_write_duration: None,
                cancel: opts.cancel.clone(),
            },
        )
        .await?;
        self.wait_for_replication(WaitOptions {
            if_writes_since: Some(ticket.issued_at()),
            ..opts
        })
        .await
    }

    fn write_counts(handles: &[LbHandle]) -> Result<BTreeMap<ClusterName, u64>, CoordinatorError> {
        handles
            .iter()
            .map(|h| Ok((h.cluster().clone(), h.balancer()?.master_write_count())))
            .collect()
    }

    /// Last write time on master `db_name`, from this request or the
    /// client's previous one.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::AccessAfterDestroy`] after destroy.
    pub async fn get_chronology_protector_touched(
        &self,
        db_name: &str,
    ) -> Result<Option<DateTime<Utc>>, CoordinatorError> {
        self.registry.ensure_live("read chronology touch")?;
        Ok(self.chronology().touched(db_name).await)
    }

    /// Turns chronology protection off for the rest of the request.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::AccessAfterDestroy`] after destroy.
    pub fn disable_chronology_protection(&self) -> Result<(), CoordinatorError> {
        self.registry.ensure_live("disable chronology protection")?;
        self.protection_disabled.store(true, Ordering::Release);
        self.chronology().disable();
        Ok(())
    }

    /// Sets the table prefix of the local domain and of every balancer.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::AccessAfterDestroy`] after destroy.
    pub async fn set_domain_prefix(&self, prefix: &str) -> Result<(), CoordinatorError> {
        let handles = self.active_handles().await?;
        {
            let mut domain = self.local_domain.write();
            *domain = domain.with_prefix(prefix);
        }
        *self.domain_prefix.write() = Some(prefix.to_string());
        for handle in &handles {
            handle.balancer()?.set_domain_prefix(prefix);
        }
        Ok(())
    }

    /// Closes all connections; handles stay usable.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::AccessAfterDestroy`] after destroy.
    pub async fn close_all(&self) -> Result<(), CoordinatorError> {
        self.registry.close_all().await
    }

    /// Sets the agent name on every current and future balancer.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::AccessAfterDestroy`] after destroy.
    pub async fn set_agent_name(&self, agent: &str) -> Result<(), CoordinatorError> {
        let handles = self.active_handles().await?;
        *self.agent.write() = Some(agent.to_string());
        for handle in &handles {
            handle.balancer()?.set_agent_name(agent);
        }
        Ok(())
    }

    /// Appends the chronology position time to a redirect URL, for hops
    /// where cookies cannot follow.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::AccessAfterDestroy`] after destroy.
    pub fn append_pre_shutdown_time_as_query(
        &self,
        url: &str,
        time: DateTime<Utc>,
    ) -> Result<String, CoordinatorError> {
        self.registry.ensure_live("append position time")?;
        Ok(append_position_time(url, time))
    }

    /// Replaces the client description used for chronology protection.
    /// Protection stays off if [`Self::disable_chronology_protection`] ran.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Configuration`] once restored positions
    /// have been loaded for the previous client.
    pub fn set_request_info(&self, request: &RequestInfo) -> Result<(), CoordinatorError> {
        self.registry.ensure_live("set request info")?;
        let mut chronology = self.chronology.write();
        if chronology.is_loaded() {
            return Err(CoordinatorError::Configuration(
                "request info cannot change after chronology positions were loaded".to_string(),
            ));
        }
        let replacement = ChronologyProtector::new(
            Arc::clone(&self.store),
            request,
            ChronologySettings::from(&self.config),
        );
        if self.protection_disabled.load(Ordering::Acquire) {
            replacement.disable();
        }
        *chronology = Arc::new(replacement);
        Ok(())
    }

    /// Ends the request: commits anything pending, captures the master
    /// positions written here and persists them according to `mode`.
    ///
    /// `work` runs once after capture. In sync mode it runs before the
    /// store write is confirmed; in async mode it runs while the write
    /// proceeds in the background. Without chronology protection nothing
    /// is captured.
    ///
    /// # Errors
    ///
    /// Returns commit errors from the final sweep or
    /// [`CoordinatorError::Backend`] if a master position cannot be read.
    /// Persistence failures are reported in [`ShutdownReport::persist`].
    pub async fn shutdown<F>(
        &self,
        mode: ShutdownMode,
        work: Option<F>,
    ) -> Result<ShutdownReport, CoordinatorError>
    where
        F: FnOnce() + Send,
    {
        self.commit_master_changes("shutdown", CommitOptions::default())
            .await?;
        let handles = self.active_handles().await?;
        let chronology = self.chronology();
        let positions = if mode == ShutdownMode::NoChronologyProtection {
            TokenSet::new()
        } else {
            chronology.capture(&handles)?
        };
        let written_at = Utc::now();

        let persist = match mode {
            ShutdownMode::Sync => {
                if let Some(work) = work {
                    work();
                }
                chronology
                    .persist_at(positions.clone(), mode, written_at)
                    .await
            }
            ShutdownMode::Async | ShutdownMode::NoChronologyProtection => {
                let persist = chronology
                    .persist_at(positions.clone(), mode, written_at)
                    .await;
                if let Some(work) = work {
                    work();
                }
                persist
            }
        };
        let position_time = match persist {
            PersistOutcome::Stored | PersistOutcome::Deferred(_) => Some(written_at),
            PersistOutcome::Skipped | PersistOutcome::Failed(_) => None,
        };
        tracing::debug!(?mode, clusters = positions.len(), "coordinator shut down");
        Ok(ShutdownReport {
            positions,
            position_time,
            persist,
        })
    }

    fn chronology(&self) -> Arc<ChronologyProtector> {
        Arc::clone(&self.chronology.read())
    }

    fn domain_or_local(&self, domain: Option<&Domain>) -> Domain {
        domain.cloned().unwrap_or_else(|| self.local_domain())
    }

    async fn get_tracked(
        &self,
        kind: &LbKind,
        domain: &Domain,
    ) -> Result<LbHandle, CoordinatorError> {
        let lookup = self.registry.get_or_create(kind, domain).await?;
        if lookup.created {
            self.prepare_tracked(&lookup.handle).await?;
        }
        Ok(lookup.handle)
    }

    /// Brings a freshly created tracked balancer in line with the request:
    /// agent name, table prefix, chronology floor and an open round.
    async fn prepare_tracked(&self, handle: &LbHandle) -> Result<(), CoordinatorError> {
        let floor = self.chronology().minimum_position_for(handle.cluster()).await;
        let balancer = handle.balancer()?;
        self.apply_identity(handle)?;
        if let Some(floor) = floor {
            balancer.apply_chronology_position(floor);
        }
        let owner = match self.round.lock().state() {
            RoundState::Active { owner } => Some(owner.clone()),
            RoundState::Inactive => None,
        };
        if let Some(owner) = owner {
            balancer
                .begin_round(&owner)
                .map_err(|e| CoordinatorError::backend(handle.cluster(), "begin_round", e))?;
        }
        Ok(())
    }

    fn new_untracked(&self, kind: &LbKind, domain: &Domain) -> Result<LbHandle, CoordinatorError> {
        let handle = self.registry.create_untracked(kind, domain)?;
        self.apply_identity(&handle)?;
        Ok(handle)
    }

    fn apply_identity(&self, handle: &LbHandle) -> Result<(), CoordinatorError> {
        let balancer = handle.balancer()?;
        if let Some(agent) = self.agent.read().as_deref() {
            balancer.set_agent_name(agent);
        }
        if let Some(prefix) = self.domain_prefix.read().as_deref() {
            balancer.set_domain_prefix(prefix);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::time::Instant;
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::domain::LoadBalancer;
    use crate::persistence::MemoryTokenStore;
    use crate::service::CancelSource;
    use crate::sim::{SimCluster, SimFactory, SimLoadBalancer};

    struct Fixture {
        factory: Arc<SimFactory>,
        store: Arc<MemoryTokenStore>,
        main: Arc<SimCluster>,
        blobs: Arc<SimCluster>,
    }

    impl Fixture {
        fn new() -> Self {
            let main = SimCluster::new(ClusterName::main(), &["r1", "r2"]);
            let blobs = SimCluster::new(ClusterName::External("blobs".to_string()), &["b1"]);
            let factory = Arc::new(
                SimFactory::new()
                    .with_cluster(Arc::clone(&main))
                    .with_cluster(Arc::clone(&blobs))
                    .with_cluster(SimCluster::new(ClusterName::Core("s2".to_string()), &["s2r1"]))
                    .with_section("metrics", "s2"),
            );
            Self {
                factory,
                store: Arc::new(MemoryTokenStore::new()),
                main,
                blobs,
            }
        }

        fn coordinator(&self) -> LbCoordinator {
            self.coordinator_for(&RequestInfo::new("192.0.2.10", "probe/1.0"))
        }

        fn coordinator_for(&self, request: &RequestInfo) -> LbCoordinator {
            let factory = Arc::clone(&self.factory) as Arc<dyn LoadBalancerFactory>;
            let store = Arc::clone(&self.store) as Arc<dyn TokenStore>;
            let config = CoordinatorConfig {
                replication_poll_interval: Duration::from_millis(5),
                ..CoordinatorConfig::default()
            };
            let Ok(coordinator) = LbCoordinator::new(config, factory, store, request) else {
                panic!("coordinator construction failed");
            };
            coordinator
        }

        fn lb(&self, name: &ClusterName) -> Arc<SimLoadBalancer> {
            let Some(lb) = self.factory.latest(name) else {
                panic!("no balancer built for {name}");
            };
            lb
        }
    }

    fn blobs() -> ClusterName {
        ClusterName::External("blobs".to_string())
    }

    #[tokio::test]
    async fn repeated_lookups_return_the_same_handle() {
        let fx = Fixture::new();
        let c = fx.coordinator();
        let Ok(a) = c.get_main_lb(None).await else {
            panic!("lookup failed");
        };
        let Ok(b) = c.get_main_lb(None).await else {
            panic!("lookup failed");
        };
        let Ok(other_domain) = c.get_main_lb(Some(&Domain::database("otherwiki"))).await else {
            panic!("lookup failed");
        };
        assert_eq!(a.id(), b.id());
        assert!(a.same_balancer(&b));
        assert!(a.same_balancer(&other_domain));
        assert_eq!(other_domain.domain().database_name(), "otherwiki");

        let Ok(x) = c.get_external_lb("blobs").await else {
            panic!("lookup failed");
        };
        let Ok(y) = c.get_external_lb("blobs").await else {
            panic!("lookup failed");
        };
        assert!(x.same_balancer(&y));
        assert_eq!(fx.factory.built_count(), 2);
    }

    #[tokio::test]
    async fn sections_split_main_clusters() {
        let fx = Fixture::new();
        let c = fx.coordinator();
        let Ok(wiki) = c.get_main_lb(None).await else {
            panic!("lookup failed");
        };
        let Ok(metrics) = c.get_main_lb(Some(&Domain::database("metrics"))).await else {
            panic!("lookup failed");
        };
        assert!(!wiki.same_balancer(&metrics));
        assert_eq!(metrics.cluster(), &ClusterName::Core("s2".to_string()));
    }

    #[tokio::test]
    async fn destroy_revokes_everything_and_is_idempotent() {
        let fx = Fixture::new();
        let c = fx.coordinator();
        let Ok(handle) = c.get_main_lb(None).await else {
            panic!("lookup failed");
        };
        c.destroy().await;
        c.destroy().await;

        assert!(fx.lb(&ClusterName::main()).is_disabled());
        assert!(matches!(handle.balancer(), Err(CoordinatorError::AccessAfterDestroy { .. })));
        assert!(matches!(
            c.get_main_lb(None).await,
            Err(CoordinatorError::AccessAfterDestroy { .. })
        ));
        assert!(matches!(
            c.new_external_lb("blobs"),
            Err(CoordinatorError::AccessAfterDestroy { .. })
        ));
        assert!(matches!(
            c.has_master_changes().await,
            Err(CoordinatorError::AccessAfterDestroy { .. })
        ));
        assert!(matches!(
            c.begin_master_changes("t").await,
            Err(CoordinatorError::AccessAfterDestroy { .. })
        ));
        assert!(matches!(
            c.rollback_master_changes("t").await,
            Err(CoordinatorError::AccessAfterDestroy { .. })
        ));
        assert!(matches!(
            c.wait_for_replication(WaitOptions::default()).await,
            Err(CoordinatorError::AccessAfterDestroy { .. })
        ));
        assert!(matches!(
            c.shutdown(ShutdownMode::Sync, None::<fn()>).await,
            Err(CoordinatorError::AccessAfterDestroy { .. })
        ));
        assert!(matches!(
            c.append_pre_shutdown_time_as_query("/x", Utc::now()),
            Err(CoordinatorError::AccessAfterDestroy { .. })
        ));
        assert!(matches!(c.close_all().await, Err(CoordinatorError::AccessAfterDestroy { .. })));
    }

    #[tokio::test]
    async fn master_change_tracking_follows_writes() {
        let fx = Fixture::new();
        let c = fx.coordinator();
        assert!(matches!(c.has_master_changes().await, Ok(false)));

        assert_ok!(c.get_main_lb(None).await);
        fx.lb(&ClusterName::main()).write(Duration::from_millis(1));
        assert!(matches!(c.has_master_changes().await, Ok(true)));

        assert_ok!(c.commit_master_changes("t", CommitOptions::default()).await);
        assert!(matches!(c.has_master_changes().await, Ok(false)));
        assert!(matches!(c.has_or_made_recent_master_changes(None).await, Ok(true)));
        assert_eq!(fx.main.master_position(), 1);

        fx.lb(&ClusterName::main()).write(Duration::ZERO);
        assert_ok!(c.rollback_master_changes("t").await);
        assert!(matches!(c.has_master_changes().await, Ok(false)));
        assert_eq!(fx.main.master_position(), 1);
    }

    #[tokio::test]
    async fn begin_twice_fails_and_rounds_reach_new_handles() {
        let fx = Fixture::new();
        let c = fx.coordinator();
        assert_ok!(c.get_main_lb(None).await);
        assert_ok!(c.begin_master_changes("first").await);
        assert!(fx.lb(&ClusterName::main()).in_round());
        assert_eq!(fx.lb(&ClusterName::main()).snapshot_flushes(), 1);

        let Err(CoordinatorError::RoundAlreadyActive { owner, caller }) =
            c.begin_master_changes("second").await
        else {
            panic!("expected RoundAlreadyActive");
        };
        assert_eq!(owner, "first");
        assert_eq!(caller, "second");

        assert_ok!(c.get_external_lb("blobs").await);
        assert!(fx.lb(&blobs()).in_round());

        assert_ok!(c.commit_master_changes("first", CommitOptions::default()).await);
        assert_eq!(c.round_state(), RoundState::Inactive);
        assert!(!fx.lb(&ClusterName::main()).in_round());
        assert_ok!(c.begin_master_changes("again").await);
    }

    #[tokio::test]
    async fn write_duration_limit_stops_remaining_commits() {
        let fx = Fixture::new();
        let c = fx.coordinator();
        assert_ok!(c.get_main_lb(None).await);
        assert_ok!(c.get_external_lb("blobs").await);
        fx.lb(&ClusterName::main()).write(Duration::from_millis(10));
        fx.lb(&blobs()).write(Duration::from_millis(1));

        let opts = CommitOptions {
            max_write_duration: Some(Duration::ZERO),
            cancel: None,
        };
        let Err(err) = c.commit_master_changes("t", opts).await else {
            panic!("expected WriteDurationExceeded");
        };
        assert_eq!(err.error_code(), 4001);
        let CoordinatorError::WriteDurationExceeded { progress, .. } = err else {
            panic!("wrong variant");
        };
        assert_eq!(progress.committed, vec![ClusterName::main()]);
        assert_eq!(progress.not_committed, vec![blobs()]);
        assert_eq!(fx.main.master_position(), 1);
        assert_eq!(fx.blobs.master_position(), 0);
        assert!(fx.lb(&blobs()).has_pending_master_changes());
        assert_eq!(c.round_state(), RoundState::Inactive);
    }

    #[tokio::test]
    async fn cancelled_commit_reports_progress() {
        let fx = Fixture::new();
        let c = fx.coordinator();
        assert_ok!(c.get_main_lb(None).await);
        fx.lb(&ClusterName::main()).write(Duration::ZERO);
        let source = CancelSource::new();
        source.cancel();
        let opts = CommitOptions {
            max_write_duration: None,
            cancel: Some(source.token()),
        };
        let Err(CoordinatorError::Cancelled {
            progress: Some(progress),
            ..
        }) = c.commit_master_changes("t", opts).await
        else {
            panic!("expected Cancelled");
        };
        assert!(progress.committed.is_empty());
        assert_eq!(progress.not_committed, vec![ClusterName::main()]);
        assert_eq!(c.round_state(), RoundState::Inactive);
    }

    #[tokio::test]
    async fn failed_commit_reports_which_clusters_landed() {
        let fx = Fixture::new();
        let c = fx.coordinator();
        assert_ok!(c.get_main_lb(None).await);
        assert_ok!(c.get_external_lb("blobs").await);
        fx.lb(&ClusterName::main()).write(Duration::ZERO);
        fx.lb(&blobs()).write(Duration::ZERO);
        fx.lb(&blobs()).fail_commits(true);

        let Err(err) = c.commit_master_changes("t", CommitOptions::default()).await else {
            panic!("expected CommitFailed");
        };
        assert_eq!(err.error_code(), 3006);
        let CoordinatorError::CommitFailed {
            cluster, progress, ..
        } = err
        else {
            panic!("wrong variant");
        };
        assert_eq!(cluster, blobs());
        assert_eq!(progress.committed, vec![ClusterName::main()]);
        assert_eq!(progress.not_committed, vec![blobs()]);
        assert_eq!(fx.main.master_position(), 1);
        assert!(fx.lb(&blobs()).has_pending_master_changes());
        assert_eq!(c.round_state(), RoundState::Inactive);
    }

    #[tokio::test]
    async fn refused_round_start_leaves_no_round_open() {
        let fx = Fixture::new();
        let c = fx.coordinator();
        assert_ok!(c.get_main_lb(None).await);
        assert_ok!(c.get_external_lb("blobs").await);
        fx.lb(&blobs()).fail_rounds(true);

        let res = c.begin_master_changes("t").await;
        assert!(matches!(
            res,
            Err(CoordinatorError::Backend {
                operation: "begin_round",
                ..
            })
        ));
        assert_eq!(c.round_state(), RoundState::Inactive);
        assert!(!fx.lb(&ClusterName::main()).in_round());
        assert!(!fx.lb(&blobs()).in_round());

        fx.lb(&blobs()).fail_rounds(false);
        assert_ok!(c.begin_master_changes("t").await);
        assert!(fx.lb(&blobs()).in_round());
    }

    #[tokio::test]
    async fn commits_record_touches_before_shutdown() {
        let fx = Fixture::new();
        let c = fx.coordinator();
        let server = fx.main.master_server();
        assert_ok!(c.get_main_lb(None).await);
        assert!(matches!(c.get_chronology_protector_touched(&server).await, Ok(None)));

        fx.lb(&ClusterName::main()).write(Duration::ZERO);
        assert_ok!(c.commit_master_changes("t", CommitOptions::default()).await);
        let touched = c.get_chronology_protector_touched(&server).await;
        assert!(matches!(touched, Ok(Some(_))));
    }

    #[tokio::test]
    async fn rollback_failures_are_swallowed() {
        let fx = Fixture::new();
        let c = fx.coordinator();
        assert_ok!(c.get_main_lb(None).await);
        assert_ok!(c.get_external_lb("blobs").await);
        assert_ok!(c.begin_master_changes("t").await);
        fx.lb(&ClusterName::main()).write(Duration::ZERO);
        fx.lb(&ClusterName::main()).fail_rollbacks(true);
        fx.lb(&blobs()).write(Duration::ZERO);

        assert_ok!(c.rollback_master_changes("t").await);
        assert_eq!(c.round_state(), RoundState::Inactive);
        assert!(!fx.lb(&blobs()).has_pending_master_changes());
    }

    #[tokio::test]
    async fn ticket_round_trip_and_staleness() {
        let fx = Fixture::new();
        let c = fx.coordinator();
        assert_ok!(c.get_main_lb(None).await);

        let Ok(ticket) = c.get_empty_transaction_ticket("t").await else {
            panic!("ticket refused");
        };
        assert_ok!(
            c.commit_and_wait_for_replication("t", &ticket, WaitOptions::default())
                .await
        );

        let Ok(ticket) = c.get_empty_transaction_ticket("t").await else {
            panic!("ticket refused");
        };
        fx.lb(&ClusterName::main()).write(Duration::ZERO);
        let res = c
            .commit_and_wait_for_replication("t", &ticket, WaitOptions::default())
            .await;
        assert!(matches!(res, Err(CoordinatorError::TicketStale { .. })));

        let Err(CoordinatorError::PendingWrites { clusters, .. }) =
            c.get_empty_transaction_ticket("t").await
        else {
            panic!("expected PendingWrites");
        };
        assert_eq!(clusters, vec![ClusterName::main()]);
    }

    #[tokio::test]
    async fn tickets_do_not_cross_coordinators_or_rounds() {
        let fx = Fixture::new();
        let a = fx.coordinator();
        let b = fx.coordinator();
        let Ok(ticket) = a.get_empty_transaction_ticket("t").await else {
            panic!("ticket refused");
        };
        let res = b
            .commit_and_wait_for_replication("t", &ticket, WaitOptions::default())
            .await;
        assert!(matches!(res, Err(CoordinatorError::TicketStale { .. })));

        assert_ok!(a.begin_master_changes("round").await);
        let res = a.get_empty_transaction_ticket("t").await;
        assert!(matches!(res, Err(CoordinatorError::RoundAlreadyActive { .. })));
    }

    #[tokio::test]
    async fn listeners_run_in_order_and_failures_abort() {
        let fx = Fixture::new();
        let c = fx.coordinator();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&calls);
        let first: ReplicationListener = Arc::new(move || -> anyhow::Result<()> {
            log.lock().push("first");
            Ok(())
        });
        let log = Arc::clone(&calls);
        let second: ReplicationListener = Arc::new(move || -> anyhow::Result<()> {
            log.lock().push("second");
            Ok(())
        });
        assert_ok!(c.set_wait_for_replication_listener("first", Some(first)));
        assert_ok!(c.set_wait_for_replication_listener("second", Some(second)));
        assert_ok!(c.wait_for_replication(WaitOptions::default()).await);
        assert_eq!(*calls.lock(), vec!["first", "second"]);

        let failing: ReplicationListener =
            Arc::new(|| -> anyhow::Result<()> { anyhow::bail!("jobs queue down") });
        assert_ok!(c.set_wait_for_replication_listener("first", Some(failing)));
        let Err(CoordinatorError::Listener { name, .. }) =
            c.wait_for_replication(WaitOptions::default()).await
        else {
            panic!("expected Listener error");
        };
        assert_eq!(name, "first");
        assert_eq!(calls.lock().len(), 2);

        assert_ok!(c.set_wait_for_replication_listener("first", None));
        assert_ok!(c.wait_for_replication(WaitOptions::default()).await);
        assert_eq!(*calls.lock(), vec!["first", "second", "second"]);
    }

    #[tokio::test]
    async fn writes_are_visible_to_the_next_request_of_the_same_client() {
        let fx = Fixture::new();
        fx.main.set_master_position(100);
        fx.main.catch_up();
        let client = RequestInfo::new("192.0.2.44", "browser/2.0");

        let first = fx.coordinator_for(&client);
        assert_ok!(first.get_main_lb(None).await);
        fx.lb(&ClusterName::main()).write(Duration::from_millis(2));
        assert_ok!(first.commit_master_changes("edit", CommitOptions::default()).await);
        assert_eq!(fx.main.master_position(), 101);
        let Ok(report) = first.shutdown(ShutdownMode::Sync, None::<fn()>).await else {
            panic!("shutdown failed");
        };
        assert!(matches!(report.persist, PersistOutcome::Stored));
        assert_eq!(report.positions.get(&ClusterName::main()), Some(PositionToken::new(101)));
        assert!(report.position_time.is_some());
        first.destroy().await;

        let second = fx.coordinator_for(&client);
        assert_ok!(second.get_main_lb(None).await);
        assert_eq!(
            fx.lb(&ClusterName::main()).chronology_floor(),
            Some(PositionToken::new(101))
        );

        let cluster = Arc::clone(&fx.main);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cluster.catch_up();
        });
        let start = Instant::now();
        assert_ok!(second.wait_for_replication(WaitOptions::default()).await);
        assert!(start.elapsed() >= Duration::from_millis(30));
        let Ok(replicas) = fx.lb(&ClusterName::main()).replica_positions() else {
            panic!("lag report failed");
        };
        assert!(replicas.values().all(|p| p.value() == 101));
    }

    #[tokio::test]
    async fn stalled_replica_times_out_for_restored_position() {
        let fx = Fixture::new();
        let client = RequestInfo::new("192.0.2.45", "browser/2.0");
        let first = fx.coordinator_for(&client);
        assert_ok!(first.get_main_lb(None).await);
        fx.lb(&ClusterName::main()).write(Duration::ZERO);
        assert_ok!(first.shutdown(ShutdownMode::Sync, None::<fn()>).await);

        let second = fx.coordinator_for(&client);
        let opts = WaitOptions {
            domain: Some(Domain::default()),
            timeout: Some(Duration::from_millis(50)),
            ..WaitOptions::default()
        };
        let Err(CoordinatorError::ReplicationWaitTimeout { cluster, .. }) =
            second.wait_for_replication(opts).await
        else {
            panic!("expected timeout");
        };
        assert_eq!(cluster, ClusterName::main());
    }

    #[tokio::test]
    async fn other_clients_do_not_wait() {
        let fx = Fixture::new();
        let first = fx.coordinator_for(&RequestInfo::new("192.0.2.46", "browser/2.0"));
        assert_ok!(first.get_main_lb(None).await);
        fx.lb(&ClusterName::main()).write(Duration::ZERO);
        assert_ok!(first.shutdown(ShutdownMode::Sync, None::<fn()>).await);

        let stranger = fx.coordinator_for(&RequestInfo::new("203.0.113.9", "other/1.0"));
        assert_ok!(stranger.get_main_lb(None).await);
        let opts = WaitOptions {
            timeout: Some(Duration::ZERO),
            ..WaitOptions::default()
        };
        assert_ok!(stranger.wait_for_replication(opts).await);
    }

    #[tokio::test]
    async fn writes_since_filter_skips_quiet_clusters() {
        let fx = Fixture::new();
        let c = fx.coordinator();
        assert_ok!(c.get_main_lb(None).await);
        assert_ok!(c.get_external_lb("blobs").await);
        fx.lb(&ClusterName::main()).write(Duration::ZERO);
        assert_ok!(c.commit_master_changes("t", CommitOptions::default()).await);
        let since = Utc::now();

        // main's replicas are behind, but its write predates `since`.
        let opts = WaitOptions {
            timeout: Some(Duration::from_millis(20)),
            if_writes_since: Some(since),
            ..WaitOptions::default()
        };
        assert_ok!(c.wait_for_replication(opts).await);

        let opts = WaitOptions {
            timeout: Some(Duration::from_millis(20)),
            ..WaitOptions::default()
        };
        assert_err!(c.wait_for_replication(opts).await);
    }

    #[tokio::test]
    async fn unbounded_wait_timeout_can_be_cancelled() {
        let fx = Fixture::new();
        let c = fx.coordinator();
        assert_ok!(c.get_main_lb(None).await);
        fx.lb(&ClusterName::main()).write(Duration::ZERO);
        assert_ok!(c.commit_master_changes("t", CommitOptions::default()).await);

        let source = CancelSource::new();
        let opts = WaitOptions {
            timeout: Some(Duration::MAX),
            cancel: Some(source.token()),
            ..WaitOptions::default()
        };
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(15)).await;
            source.cancel();
        });
        let res = c.wait_for_replication(opts).await;
        assert!(matches!(res, Err(CoordinatorError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn cluster_scope_must_name_a_tracked_cluster() {
        let fx = Fixture::new();
        let c = fx.coordinator();
        let opts = WaitOptions {
            cluster: Some("blobs".to_string()),
            ..WaitOptions::default()
        };
        let res = c.wait_for_replication(opts.clone()).await;
        assert!(matches!(res, Err(CoordinatorError::UnknownCluster(_))));

        assert_ok!(c.get_external_lb("blobs").await);
        assert_ok!(c.wait_for_replication(opts).await);
    }

    #[tokio::test]
    async fn untracked_handles_stay_out_of_bulk_operations() {
        let fx = Fixture::new();
        let c = fx.coordinator();
        let Ok(own) = c.new_external_lb("blobs") else {
            panic!("create failed");
        };
        assert!(!own.is_tracked());
        fx.lb(&blobs()).write(Duration::ZERO);
        assert!(matches!(c.has_master_changes().await, Ok(false)));
        let Ok(active) = c.active_handles().await else {
            panic!("snapshot failed");
        };
        assert!(active.is_empty());
        assert_ok!(own.close());
        assert!(fx.lb(&blobs()).is_disabled());
    }

    #[tokio::test]
    async fn for_each_visits_handles_in_registration_order() {
        let fx = Fixture::new();
        let c = fx.coordinator();
        assert_ok!(c.get_external_lb("blobs").await);
        assert_ok!(c.get_main_lb(None).await);
        let mut seen = Vec::new();
        assert_ok!(
            c.for_each_lb(|h| {
                seen.push(h.cluster().clone());
                Ok(())
            })
            .await
        );
        assert_eq!(seen, vec![blobs(), ClusterName::main()]);
    }

    #[tokio::test]
    async fn agent_and_prefix_reach_old_and_new_handles() {
        let fx = Fixture::new();
        let c = fx.coordinator();
        assert_ok!(c.get_main_lb(None).await);
        assert_ok!(c.set_agent_name("jobrunner").await);
        assert_ok!(c.set_domain_prefix("mw_").await);
        assert_eq!(fx.lb(&ClusterName::main()).agent().as_deref(), Some("jobrunner"));
        assert_eq!(c.local_domain().prefix(), "mw_");

        assert_ok!(c.get_external_lb("blobs").await);
        assert_eq!(fx.lb(&blobs()).agent().as_deref(), Some("jobrunner"));
        assert_eq!(fx.lb(&blobs()).prefix().as_deref(), Some("mw_"));
    }

    #[tokio::test]
    async fn lagged_replica_usage_is_reported() {
        let fx = Fixture::new();
        let c = fx.coordinator();
        assert_ok!(c.get_main_lb(None).await);
        assert!(matches!(c.lagged_replica_used().await, Ok(false)));
        fx.lb(&ClusterName::main()).mark_lagged();
        assert!(matches!(c.lagged_replica_used().await, Ok(true)));
    }

    #[tokio::test]
    async fn commit_all_flushes_snapshots() {
        let fx = Fixture::new();
        let c = fx.coordinator();
        assert_ok!(c.get_main_lb(None).await);
        fx.lb(&ClusterName::main()).write(Duration::ZERO);
        assert_ok!(c.commit_all("t", CommitOptions::default()).await);
        assert_eq!(fx.main.master_position(), 1);
        assert_eq!(fx.lb(&ClusterName::main()).snapshot_flushes(), 1);
        assert_ok!(c.close_all().await);
        assert_eq!(fx.lb(&ClusterName::main()).close_count(), 1);
    }

    #[tokio::test]
    async fn shutdown_commits_pending_work_and_runs_callback_once() {
        let fx = Fixture::new();
        let c = fx.coordinator();
        assert_ok!(c.get_main_lb(None).await);
        fx.lb(&ClusterName::main()).write(Duration::ZERO);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let Ok(report) = c
            .shutdown(
                ShutdownMode::Async,
                Some(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
        else {
            panic!("shutdown failed");
        };
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(fx.main.master_position(), 1);
        let PersistOutcome::Deferred(task) = report.persist else {
            panic!("expected background write");
        };
        assert!(matches!(task.await, Ok(Ok(()))));
        assert_eq!(fx.store.len().await, 1);
    }

    #[tokio::test]
    async fn shutdown_without_protection_persists_nothing() {
        let fx = Fixture::new();
        let c = fx.coordinator();
        assert_ok!(c.get_main_lb(None).await);
        fx.lb(&ClusterName::main()).write(Duration::ZERO);
        let Ok(report) = c.shutdown(ShutdownMode::NoChronologyProtection, None::<fn()>).await else {
            panic!("shutdown failed");
        };
        assert!(matches!(report.persist, PersistOutcome::Skipped));
        assert!(report.positions.is_empty());
        assert!(report.position_time.is_none());
        assert!(fx.store.is_empty().await);
    }

    #[tokio::test]
    async fn disabled_protection_skips_restore_and_persist() {
        let fx = Fixture::new();
        let c = fx.coordinator();
        assert_ok!(c.disable_chronology_protection());
        assert_ok!(c.get_main_lb(None).await);
        fx.lb(&ClusterName::main()).write(Duration::ZERO);
        let Ok(report) = c.shutdown(ShutdownMode::Sync, None::<fn()>).await else {
            panic!("shutdown failed");
        };
        assert!(report.positions.is_empty());
        assert!(matches!(report.persist, PersistOutcome::Skipped));
    }

    #[tokio::test]
    async fn disabled_protection_survives_request_info_change() {
        let fx = Fixture::new();
        let client = RequestInfo::new("192.0.2.48", "browser/2.0");
        let c = fx.coordinator_for(&client);
        assert_ok!(c.disable_chronology_protection());
        assert_ok!(c.set_request_info(&client));
        assert_ok!(c.get_main_lb(None).await);
        fx.lb(&ClusterName::main()).write(Duration::ZERO);
        assert_ok!(c.commit_master_changes("t", CommitOptions::default()).await);

        let Ok(report) = c.shutdown(ShutdownMode::Sync, None::<fn()>).await else {
            panic!("shutdown failed");
        };
        assert!(report.positions.is_empty());
        assert!(matches!(report.persist, PersistOutcome::Skipped));
        assert!(fx.store.is_empty().await);
    }

    #[tokio::test]
    async fn touched_times_survive_the_request() {
        let fx = Fixture::new();
        let client = RequestInfo::new("192.0.2.47", "browser/2.0");
        let first = fx.coordinator_for(&client);
        assert_ok!(first.get_main_lb(None).await);
        fx.lb(&ClusterName::main()).write(Duration::ZERO);
        assert_ok!(first.shutdown(ShutdownMode::Sync, None::<fn()>).await);

        let second = fx.coordinator_for(&client);
        let touched = second.get_chronology_protector_touched(&fx.main.master_server()).await;
        assert!(matches!(touched, Ok(Some(_))));
    }

    #[tokio::test]
    async fn request_info_is_fixed_once_positions_load() {
        let fx = Fixture::new();
        let c = fx.coordinator();
        assert_ok!(c.set_request_info(&RequestInfo::new("192.0.2.99", "cli")));
        assert_ok!(c.get_main_lb(None).await);
        let res = c.set_request_info(&RequestInfo::new("192.0.2.100", "cli"));
        assert!(matches!(res, Err(CoordinatorError::Configuration(_))));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let fx = Fixture::new();
        let config = CoordinatorConfig {
            chronology_key_prefix: String::new(),
            ..CoordinatorConfig::default()
        };
        let res = LbCoordinator::new(
            config,
            Arc::clone(&fx.factory) as Arc<dyn LoadBalancerFactory>,
            Arc::clone(&fx.store) as Arc<dyn TokenStore>,
            &RequestInfo::cli(),
        );
        assert!(matches!(res, Err(CoordinatorError::Configuration(_))));
    }

    #[tokio::test]
    async fn position_time_is_appended_to_redirects() {
        let fx = Fixture::new();
        let c = fx.coordinator();
        let Some(t) = DateTime::from_timestamp(1_700_000_000, 0) else {
            panic!("bad timestamp");
        };
        let edit = "https://example.org/wiki/Main?action=edit";
        let Ok(url) = c.append_pre_shutdown_time_as_query(edit, t) else {
            panic!("append failed");
        };
        assert_eq!(url, format!("{edit}&cpPosTime=1700000000.000000"));
    }
}
