//! Load balancer collaborator contracts and the handle wrapper.
//!
//! The coordinator never opens connections itself. Each physical cluster is
//! fronted by an external [`LoadBalancer`] produced by a
//! [`LoadBalancerFactory`]; the coordinator hands callers [`LbHandle`]s that
//! scope a shared balancer to one [`Domain`] and refuse use after the owning
//! registry is destroyed.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{ClusterName, Domain, PositionToken};
use crate::error::CoordinatorError;

/// Connection-pool abstraction fronting one cluster (one master, N replicas).
///
/// Implementations own sockets, SQL execution and lag reporting. All methods
/// are expected to return quickly; blocking waits are driven by the
/// coordinator through [`LoadBalancer::replica_positions`] polling.
pub trait LoadBalancer: Send + Sync + fmt::Debug {
    /// Name of the master server, used as the chronology touch key.
    fn master_server_name(&self) -> String;

    /// Ends any open read snapshot on replica connections.
    ///
    /// # Errors
    ///
    /// Returns the collaborator's failure.
    fn flush_replica_snapshots(&self, caller: &str) -> anyhow::Result<()>;

    /// Enters transaction-round mode; subsequent writes are grouped.
    ///
    /// # Errors
    ///
    /// Returns the collaborator's failure.
    fn begin_round(&self, caller: &str) -> anyhow::Result<()>;

    /// Leaves transaction-round mode once the round is committed or rolled
    /// back.
    fn finish_round(&self, caller: &str);

    /// Returns `true` if a master connection holds uncommitted writes.
    fn has_pending_master_changes(&self) -> bool;

    /// Cumulative time spent in write queries of the pending transaction.
    fn pending_write_duration(&self) -> Duration;

    /// Monotonic count of master writes issued through this balancer.
    fn master_write_count(&self) -> u64;

    /// Time of the last master write issued through this balancer.
    fn last_master_write(&self) -> Option<DateTime<Utc>>;

    /// Commits pending master writes.
    ///
    /// # Errors
    ///
    /// Returns the collaborator's failure.
    fn commit(&self, caller: &str) -> anyhow::Result<()>;

    /// Rolls back pending master writes.
    ///
    /// # Errors
    ///
    /// Returns the collaborator's failure.
    fn rollback(&self, caller: &str) -> anyhow::Result<()>;

    /// Current master position, or `None` if the cluster has no replication.
    ///
    /// # Errors
    ///
    /// Returns the collaborator's failure.
    fn master_position(&self) -> anyhow::Result<Option<PositionToken>>;

    /// Positions of every replica, keyed by replica id.
    ///
    /// # Errors
    ///
    /// Returns the collaborator's failure.
    fn replica_positions(&self) -> anyhow::Result<BTreeMap<String, PositionToken>>;

    /// Returns `true` if a lagged replica had to serve reads.
    fn lagged_replica_used(&self) -> bool;

    /// Hint that replicas behind `position` should not serve this client.
    fn apply_chronology_position(&self, _position: PositionToken) {}

    /// Sets the agent name used in query comments.
    fn set_agent_name(&self, _agent: &str) {}

    /// Sets the table prefix for the local domain.
    fn set_domain_prefix(&self, _prefix: &str) {}

    /// Closes all open connections; the balancer stays usable.
    fn close_all(&self);

    /// Closes everything and refuses further use.
    fn disable(&self);
}

/// Builds [`LoadBalancer`]s for core sections and external clusters.
pub trait LoadBalancerFactory: Send + Sync + fmt::Debug {
    /// Core section serving `domain`.
    fn section_for(&self, domain: &Domain) -> String;

    /// Creates a balancer for a core section.
    ///
    /// # Errors
    ///
    /// Returns an error if the section is unknown or cannot be reached.
    fn new_main(&self, section: &str, domain: &Domain) -> anyhow::Result<Arc<dyn LoadBalancer>>;

    /// Creates a balancer for an external cluster.
    ///
    /// # Errors
    ///
    /// Returns an error if the cluster is unknown or cannot be reached.
    fn new_external(&self, cluster: &str) -> anyhow::Result<Arc<dyn LoadBalancer>>;
}

/// Stable id of a cached balancer within one registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    /// Wraps a raw id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lb#{}", self.0)
    }
}

/// A balancer scoped to a domain.
///
/// Tracked handles share the registry's revocation flag: after
/// `destroy()` every accessor fails with
/// [`CoordinatorError::AccessAfterDestroy`]. Untracked handles carry their
/// own flag, revoked only by [`LbHandle::close`].
#[derive(Debug, Clone)]
pub struct LbHandle {
    id: HandleId,
    cluster: ClusterName,
    domain: Domain,
    balancer: Arc<dyn LoadBalancer>,
    revoked: Arc<AtomicBool>,
    tracked: bool,
}

impl LbHandle {
    pub(crate) fn tracked(
        id: HandleId,
        cluster: ClusterName,
        domain: Domain,
        balancer: Arc<dyn LoadBalancer>,
        revoked: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            cluster,
            domain,
            balancer,
            revoked,
            tracked: true,
        }
    }

    pub(crate) fn untracked(
        id: HandleId,
        cluster: ClusterName,
        domain: Domain,
        balancer: Arc<dyn LoadBalancer>,
    ) -> Self {
        Self {
            id,
            cluster,
            domain,
            balancer,
            revoked: Arc::new(AtomicBool::new(false)),
            tracked: false,
        }
    }

    /// Registry-scoped id; equal ids mean the same cached balancer.
    #[must_use]
    pub const fn id(&self) -> HandleId {
        self.id
    }

    /// Cluster this handle fronts.
    #[must_use]
    pub const fn cluster(&self) -> &ClusterName {
        &self.cluster
    }

    /// Domain this handle is scoped to.
    #[must_use]
    pub const fn domain(&self) -> &Domain {
        &self.domain
    }

    /// Returns `true` if the registry tracks this handle.
    #[must_use]
    pub const fn is_tracked(&self) -> bool {
        self.tracked
    }

    /// Returns `true` if both handles share one underlying balancer.
    #[must_use]
    pub fn same_balancer(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.balancer, &other.balancer)
    }

    /// The underlying balancer.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::AccessAfterDestroy`] once the handle has
    /// been revoked.
    pub fn balancer(&self) -> Result<&dyn LoadBalancer, CoordinatorError> {
        if self.revoked.load(Ordering::Acquire) {
            return Err(CoordinatorError::AccessAfterDestroy {
                operation: "balancer",
            });
        }
        Ok(self.balancer.as_ref())
    }

    /// Closes an untracked handle and revokes it. Tracked handles are owned
    /// by the registry and are only closed through it.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Configuration`] for a tracked handle.
    pub fn close(&self) -> Result<(), CoordinatorError> {
        if self.tracked {
            return Err(CoordinatorError::Configuration(format!(
                "{} is owned by its registry",
                self.id
            )));
        }
        if !self.revoked.swap(true, Ordering::AcqRel) {
            self.balancer.disable();
        }
        Ok(())
    }
}
