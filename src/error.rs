//! Coordinator error types with stable numeric codes.
//!
//! [`CoordinatorError`] is the central error type of the crate. Each variant
//! maps to a numeric code so surrounding services can report failures
//! without matching on message text.

use std::time::Duration;

use crate::domain::{ClusterName, CommitProgress};

/// Error enum covering every failure the coordinator surfaces.
///
/// # Error Code Ranges
///
/// | Range     | Category                      |
/// |-----------|-------------------------------|
/// | 1000–1999 | Configuration / lifecycle     |
/// | 2000–2999 | Caller protocol violations    |
/// | 3000–3999 | Collaborator failures         |
/// | 4000–4999 | Consistency and timeouts      |
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// Invalid construction arguments or configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An operation was attempted after `destroy()`.
    #[error("load balancer factory destroyed; cannot {operation}")]
    AccessAfterDestroy {
        /// The rejected operation.
        operation: &'static str,
    },

    /// `begin_master_changes` was called while a round is open.
    #[error("transaction round already active (owner {owner}, caller {caller})")]
    RoundAlreadyActive {
        /// Caller that opened the current round.
        owner: String,
        /// Caller that attempted to open another.
        caller: String,
    },

    /// An empty-transaction ticket was requested while writes are pending.
    #[error("{caller}: master writes pending on [{}]", fmt_clusters(.clusters))]
    PendingWrites {
        /// Caller tag.
        caller: String,
        /// Clusters holding uncommitted writes.
        clusters: Vec<ClusterName>,
    },

    /// A ticket was used after new master writes or by another coordinator.
    #[error("transaction ticket is stale: {reason}")]
    TicketStale {
        /// Why the ticket no longer holds.
        reason: String,
    },

    /// Cumulative write time exceeded the limit; remaining commits aborted.
    #[error("write duration {elapsed:?} exceeded limit {limit:?}; {progress}")]
    WriteDurationExceeded {
        /// Write time accumulated by committed clusters.
        elapsed: Duration,
        /// Configured limit.
        limit: Duration,
        /// Which clusters were and were not committed.
        progress: CommitProgress,
    },

    /// Replicas of a cluster did not catch up in time.
    #[error("replication wait timed out after {timeout:?} on {cluster}")]
    ReplicationWaitTimeout {
        /// First cluster that timed out.
        cluster: ClusterName,
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// A registered replication listener failed.
    #[error("replication listener {name:?} failed: {source}")]
    Listener {
        /// Listener name.
        name: String,
        /// The listener's error.
        #[source]
        source: anyhow::Error,
    },

    /// A load balancer operation failed.
    #[error("{cluster}: {operation} failed: {source}")]
    Backend {
        /// Cluster whose balancer failed.
        cluster: ClusterName,
        /// Operation that failed.
        operation: &'static str,
        /// Collaborator error.
        #[source]
        source: anyhow::Error,
    },

    /// A cluster refused its commit; earlier clusters stay committed.
    #[error("{cluster}: commit failed: {source}; {progress}")]
    CommitFailed {
        /// Cluster whose commit failed.
        cluster: ClusterName,
        /// Which clusters were and were not committed.
        progress: CommitProgress,
        /// Collaborator error.
        #[source]
        source: anyhow::Error,
    },

    /// The factory could not create a balancer.
    #[error("cannot create load balancer for {cluster}: {source}")]
    HandleCreation {
        /// Requested cluster.
        cluster: ClusterName,
        /// Factory error.
        #[source]
        source: anyhow::Error,
    },

    /// No cluster matched a wait scope.
    #[error("unknown cluster: {0}")]
    UnknownCluster(String),

    /// A blocking operation was cancelled by the caller.
    #[error("{operation} cancelled{}", fmt_progress(.progress.as_ref()))]
    Cancelled {
        /// Operation that was interrupted.
        operation: &'static str,
        /// Partial commit state, for cancelled commits.
        progress: Option<CommitProgress>,
    },

    /// The chronology token store failed.
    #[error("token store error: {0}")]
    Store(String),

    /// A stored record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoordinatorError {
    /// Returns the numeric error code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> u32 {
        match self {
            Self::Configuration(_) => 1001,
            Self::AccessAfterDestroy { .. } => 1002,
            Self::RoundAlreadyActive { .. } => 2001,
            Self::PendingWrites { .. } => 2002,
            Self::TicketStale { .. } => 2003,
            Self::Listener { .. } => 2004,
            Self::Backend { .. } => 3001,
            Self::HandleCreation { .. } => 3002,
            Self::UnknownCluster(_) => 3003,
            Self::Store(_) => 3004,
            Self::Serialization(_) => 3005,
            Self::CommitFailed { .. } => 3006,
            Self::WriteDurationExceeded { .. } => 4001,
            Self::ReplicationWaitTimeout { .. } => 4002,
            Self::Cancelled { .. } => 4003,
        }
    }

    /// Returns `true` for caller protocol violations the caller can recover
    /// from by retrying correctly.
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(self.error_code(), 2000..=2999)
    }

    pub(crate) fn backend(
        cluster: &ClusterName,
        operation: &'static str,
        source: anyhow::Error,
    ) -> Self {
        Self::Backend {
            cluster: cluster.clone(),
            operation,
            source,
        }
    }
}

fn fmt_progress(progress: Option<&CommitProgress>) -> String {
    progress.map(|p| format!("; {p}")).unwrap_or_default()
}

fn fmt_clusters(clusters: &[ClusterName]) -> String {
    clusters
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
