//! Bounded waits for replicas to reach a master position.
//!
//! [`ReplicationWaiter`] polls a balancer's replica positions until every
//! replica has reached the target, the timeout elapses, or the caller
//! cancels. Waits on independent clusters are run concurrently by
//! [`ReplicationWaiter::wait_all`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tokio::time::Instant;

use super::Cancellation;
use crate::domain::{ClusterName, Domain, LbHandle, PositionToken};
use crate::error::CoordinatorError;

/// Outcome of waiting on one cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// Every replica reached the target.
    CaughtUp,
    /// The timeout elapsed first.
    TimedOut,
    /// The cluster has no replicas; nothing to wait for.
    NoReplicas,
}

impl WaitResult {
    /// Returns `true` for outcomes that allow the caller to proceed.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::CaughtUp | Self::NoReplicas)
    }
}

/// Options for a coordinator-level replication wait.
#[derive(Debug, Clone, Default)]
pub struct WaitOptions {
    /// Restrict the wait to the main cluster of this domain.
    pub domain: Option<Domain>,
    /// Restrict the wait to this external cluster.
    pub cluster: Option<String>,
    /// Overall bound; defaults to the configured replication wait timeout.
    pub timeout: Option<Duration>,
    /// Skip clusters with no writes after this time (and no restored
    /// chronology minimum).
    pub if_writes_since: Option<DateTime<Utc>>,
    /// Caller-side cancellation.
    pub cancel: Option<Cancellation>,
}

/// Bound on deadlines whose timeout would overflow the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Instant `timeout` from now, clamped to a far-future instant instead of
/// overflowing.
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or(now + FAR_FUTURE)
}

/// Polling replication waiter.
#[derive(Debug, Clone)]
pub struct ReplicationWaiter {
    poll_interval: Duration,
}

impl ReplicationWaiter {
    /// Creates a waiter polling every `poll_interval`.
    #[must_use]
    pub const fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Waits until every replica behind `handle` is at or past `target`.
    ///
    /// The first check happens before any sleep, so a cluster that is
    /// already caught up returns immediately even with a zero timeout.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Backend`] if lag reporting fails,
    /// [`CoordinatorError::Cancelled`] if `cancel` fires, or
    /// [`CoordinatorError::AccessAfterDestroy`] for a revoked handle.
    pub async fn wait_for(
        &self,
        handle: &LbHandle,
        target: PositionToken,
        timeout: Duration,
        cancel: Option<&Cancellation>,
    ) -> Result<WaitResult, CoordinatorError> {
        let deadline = deadline_after(timeout);
        loop {
            let balancer = handle.balancer()?;
            let replicas = balancer
                .replica_positions()
                .map_err(|e| CoordinatorError::backend(handle.cluster(), "replica_positions", e))?;
            if replicas.is_empty() {
                return Ok(WaitResult::NoReplicas);
            }
            if replicas.values().all(|pos| pos.has_reached(target)) {
                return Ok(WaitResult::CaughtUp);
            }

            let now = Instant::now();
            if now >= deadline {
                let lagging: Vec<&String> = replicas
                    .iter()
                    .filter(|(_, pos)| !pos.has_reached(target))
                    .map(|(id, _)| id)
                    .collect();
                tracing::warn!(
                    cluster = %handle.cluster(),
                    %target,
                    ?lagging,
                    "replicas did not catch up in time"
                );
                return Ok(WaitResult::TimedOut);
            }

            let step = self.poll_interval.min(deadline - now);
            match cancel {
                Some(cancel) => {
                    tokio::select! {
                        () = tokio::time::sleep(step) => {}
                        () = cancel.cancelled() => {
                            return Err(CoordinatorError::Cancelled {
                                operation: "wait for replication",
                                progress: None,
                            });
                        }
                    }
                }
                None => tokio::time::sleep(step).await,
            }
        }
    }

    /// Waits on every `(handle, target)` pair concurrently and aggregates.
    ///
    /// # Errors
    ///
    /// Returns the first collaborator or cancellation error in handle order,
    /// otherwise [`CoordinatorError::ReplicationWaitTimeout`] naming the
    /// first cluster that timed out.
    pub async fn wait_all(
        &self,
        targets: &[(LbHandle, PositionToken)],
        timeout: Duration,
        cancel: Option<&Cancellation>,
    ) -> Result<(), CoordinatorError> {
        let results = join_all(
            targets
                .iter()
                .map(|(handle, target)| self.wait_for(handle, *target, timeout, cancel)),
        )
        .await;

        let mut timed_out: Option<&ClusterName> = None;
        for ((handle, _), result) in targets.iter().zip(results) {
            match result? {
                WaitResult::TimedOut => {
                    timed_out.get_or_insert(handle.cluster());
                }
                WaitResult::CaughtUp | WaitResult::NoReplicas => {}
            }
        }
        match timed_out {
            Some(cluster) => Err(CoordinatorError::ReplicationWaitTimeout {
                cluster: cluster.clone(),
                timeout,
            }),
            None => Ok(()),
        }
    }
}
