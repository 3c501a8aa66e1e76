//! Simulated physical cluster and per-request balancer.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::domain::{ClusterName, LoadBalancer, PositionToken};

#[derive(Debug, Default)]
struct ClusterState {
    master: u64,
    replicas: BTreeMap<String, u64>,
    replication: bool,
}

/// Shared state of one simulated cluster: one master, N replicas.
///
/// Replicas never advance on their own; tests and the probe binary move
/// them with [`SimCluster::set_replica_position`] or
/// [`SimCluster::catch_up`].
#[derive(Debug)]
pub struct SimCluster {
    name: ClusterName,
    state: Mutex<ClusterState>,
}

impl SimCluster {
    /// Creates a cluster at position 0 with the given replica ids.
    #[must_use]
    pub fn new(name: ClusterName, replicas: &[&str]) -> Arc<Self> {
        let state = ClusterState {
            master: 0,
            replicas: replicas.iter().map(|r| ((*r).to_string(), 0)).collect(),
            replication: true,
        };
        Arc::new(Self {
            name,
            state: Mutex::new(state),
        })
    }

    /// Creates a standalone master with no replication at all; its master
    /// position is reported as `None`.
    #[must_use]
    pub fn standalone(name: ClusterName) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: Mutex::new(ClusterState::default()),
        })
    }

    /// Cluster name.
    #[must_use]
    pub const fn name(&self) -> &ClusterName {
        &self.name
    }

    /// Master server name used for chronology touches.
    #[must_use]
    pub fn master_server(&self) -> String {
        format!("{}-master", self.name)
    }

    /// Current master position.
    #[must_use]
    pub fn master_position(&self) -> u64 {
        self.state.lock().master
    }

    /// Forces the master position.
    pub fn set_master_position(&self, position: u64) {
        self.state.lock().master = position;
    }

    /// Moves one replica to `position`; unknown ids are added.
    pub fn set_replica_position(&self, replica: &str, position: u64) {
        self.state.lock().replicas.insert(replica.to_string(), position);
    }

    /// Moves every replica to the master position.
    pub fn catch_up(&self) {
        let mut state = self.state.lock();
        let master = state.master;
        for pos in state.replicas.values_mut() {
            *pos = master;
        }
    }

    fn apply_commit(&self, writes: u64) {
        let mut state = self.state.lock();
        state.master = state.master.saturating_add(writes);
    }
}

#[derive(Debug, Default)]
struct LbState {
    pending_writes: u64,
    pending_duration: Duration,
    write_count: u64,
    last_write: Option<DateTime<Utc>>,
    in_round: bool,
    snapshot_flushes: usize,
    close_count: usize,
    disabled: bool,
    lagged: bool,
    fail_commit: bool,
    fail_rollback: bool,
    fail_round: bool,
    chronology_floor: Option<PositionToken>,
    agent: Option<String>,
    prefix: Option<String>,
}

/// One request's balancer onto a [`SimCluster`].
#[derive(Debug)]
pub struct SimLoadBalancer {
    cluster: Arc<SimCluster>,
    state: Mutex<LbState>,
}

impl SimLoadBalancer {
    /// Creates a balancer onto `cluster`.
    #[must_use]
    pub fn new(cluster: Arc<SimCluster>) -> Self {
        Self {
            cluster,
            state: Mutex::new(LbState::default()),
        }
    }

    /// The cluster behind this balancer.
    #[must_use]
    pub const fn cluster(&self) -> &Arc<SimCluster> {
        &self.cluster
    }

    /// Issues one master write that took `took` to execute.
    pub fn write(&self, took: Duration) {
        let mut state = self.state.lock();
        state.pending_writes += 1;
        state.pending_duration += took;
        state.write_count += 1;
        state.last_write = Some(Utc::now());
    }

    /// Makes the next commits fail.
    pub fn fail_commits(&self, fail: bool) {
        self.state.lock().fail_commit = fail;
    }

    /// Makes the next rollbacks fail.
    pub fn fail_rollbacks(&self, fail: bool) {
        self.state.lock().fail_rollback = fail;
    }

    /// Makes the next round starts fail.
    pub fn fail_rounds(&self, fail: bool) {
        self.state.lock().fail_round = fail;
    }

    /// Marks that a lagged replica served reads.
    pub fn mark_lagged(&self) {
        self.state.lock().lagged = true;
    }

    /// Returns `true` while in transaction-round mode.
    #[must_use]
    pub fn in_round(&self) -> bool {
        self.state.lock().in_round
    }

    /// Number of replica snapshot flushes.
    #[must_use]
    pub fn snapshot_flushes(&self) -> usize {
        self.state.lock().snapshot_flushes
    }

    /// Number of `close_all` calls.
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.state.lock().close_count
    }

    /// Returns `true` once disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.state.lock().disabled
    }

    /// Chronology floor received from the coordinator.
    #[must_use]
    pub fn chronology_floor(&self) -> Option<PositionToken> {
        self.state.lock().chronology_floor
    }

    /// Agent name received from the coordinator.
    #[must_use]
    pub fn agent(&self) -> Option<String> {
        self.state.lock().agent.clone()
    }

    /// Table prefix received from the coordinator.
    #[must_use]
    pub fn prefix(&self) -> Option<String> {
        self.state.lock().prefix.clone()
    }

    fn check_enabled(state: &LbState) -> anyhow::Result<()> {
        if state.disabled {
            anyhow::bail!("load balancer is disabled");
        }
        Ok(())
    }
}

impl LoadBalancer for SimLoadBalancer {
    fn master_server_name(&self) -> String {
        self.cluster.master_server()
    }

    fn flush_replica_snapshots(&self, _caller: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        Self::check_enabled(&state)?;
        state.snapshot_flushes += 1;
        Ok(())
    }

    fn begin_round(&self, _caller: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        Self::check_enabled(&state)?;
        if state.fail_round {
            anyhow::bail!("round refused by {}", self.cluster.master_server());
        }
        state.in_round = true;
        Ok(())
    }

    fn finish_round(&self, _caller: &str) {
        self.state.lock().in_round = false;
    }

    fn has_pending_master_changes(&self) -> bool {
        self.state.lock().pending_writes > 0
    }

    fn pending_write_duration(&self) -> Duration {
        self.state.lock().pending_duration
    }

    fn master_write_count(&self) -> u64 {
        self.state.lock().write_count
    }

    fn last_master_write(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_write
    }

    fn commit(&self, _caller: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        Self::check_enabled(&state)?;
        if state.fail_commit {
            anyhow::bail!("commit refused by {}", self.cluster.master_server());
        }
        if state.pending_writes > 0 {
            self.cluster.apply_commit(state.pending_writes);
        }
        state.pending_writes = 0;
        state.pending_duration = Duration::ZERO;
        Ok(())
    }

    fn rollback(&self, _caller: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if state.fail_rollback {
            anyhow::bail!("rollback failed on {}", self.cluster.master_server());
        }
        state.pending_writes = 0;
        state.pending_duration = Duration::ZERO;
        Ok(())
    }

    fn master_position(&self) -> anyhow::Result<Option<PositionToken>> {
        Self::check_enabled(&self.state.lock())?;
        let cluster = self.cluster.state.lock();
        if !cluster.replication {
            return Ok(None);
        }
        Ok(Some(PositionToken::new(cluster.master)))
    }

    fn replica_positions(&self) -> anyhow::Result<BTreeMap<String, PositionToken>> {
        Self::check_enabled(&self.state.lock())?;
        let cluster = self.cluster.state.lock();
        Ok(cluster
            .replicas
            .iter()
            .map(|(id, pos)| (id.clone(), PositionToken::new(*pos)))
            .collect())
    }

    fn lagged_replica_used(&self) -> bool {
        self.state.lock().lagged
    }

    fn apply_chronology_position(&self, position: PositionToken) {
        self.state.lock().chronology_floor = Some(position);
    }

    fn set_agent_name(&self, agent: &str) {
        self.state.lock().agent = Some(agent.to_string());
    }

    fn set_domain_prefix(&self, prefix: &str) {
        self.state.lock().prefix = Some(prefix.to_string());
    }

    fn close_all(&self) {
        self.state.lock().close_count += 1;
    }

    fn disable(&self) {
        let mut state = self.state.lock();
        state.disabled = true;
        state.pending_writes = 0;
    }
}
