//! Master transaction round state and empty-transaction tickets.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::ClusterName;
use crate::error::CoordinatorError;

/// Lifecycle of a transaction round.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RoundState {
    /// No round is open.
    #[default]
    Inactive,
    /// A round was opened by `owner`.
    Active {
        /// Caller tag that began the round.
        owner: String,
    },
}

/// Round state plus the last master write time, owned by one coordinator.
#[derive(Debug, Default)]
pub struct RoundTracker {
    state: RoundState,
    last_master_write: Option<DateTime<Utc>>,
}

impl RoundTracker {
    /// Creates an inactive tracker with no recorded writes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> &RoundState {
        &self.state
    }

    /// Returns `true` while a round is open.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self.state, RoundState::Active { .. })
    }

    /// Opens a round for `caller`.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::RoundAlreadyActive`] if a round is open.
    pub fn begin(&mut self, caller: &str) -> Result<(), CoordinatorError> {
        self.ensure_inactive(caller)?;
        self.state = RoundState::Active {
            owner: caller.to_string(),
        };
        Ok(())
    }

    /// Fails if a round is open.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::RoundAlreadyActive`] naming the owner.
    pub fn ensure_inactive(&self, caller: &str) -> Result<(), CoordinatorError> {
        if let RoundState::Active { owner } = &self.state {
            return Err(CoordinatorError::RoundAlreadyActive {
                owner: owner.clone(),
                caller: caller.to_string(),
            });
        }
        Ok(())
    }

    /// Closes the round. Idempotent.
    pub fn finish(&mut self) {
        self.state = RoundState::Inactive;
    }

    /// Records that master writes were committed at `at`.
    pub fn record_master_write(&mut self, at: DateTime<Utc>) {
        self.last_master_write = Some(self.last_master_write.map_or(at, |prev| prev.max(at)));
    }

    /// Time of the last committed master write.
    #[must_use]
    pub const fn last_master_write(&self) -> Option<DateTime<Utc>> {
        self.last_master_write
    }

    /// Returns `true` if the last committed write is at most `age` old.
    #[must_use]
    pub fn wrote_within(&self, now: DateTime<Utc>, age: Duration) -> bool {
        let Some(last) = self.last_master_write else {
            return false;
        };
        let Ok(age) = chrono::Duration::from_std(age) else {
            return true;
        };
        now.signed_duration_since(last) <= age
    }
}

/// Proof that no master writes were pending when it was issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionTicket {
    coordinator: Uuid,
    issued_at: DateTime<Utc>,
    write_counts: BTreeMap<ClusterName, u64>,
}

impl TransactionTicket {
    pub(crate) const fn new(
        coordinator: Uuid,
        issued_at: DateTime<Utc>,
        write_counts: BTreeMap<ClusterName, u64>,
    ) -> Self {
        Self {
            coordinator,
            issued_at,
            write_counts,
        }
    }

    /// Issuance time; used as the `if_writes_since` bound of the paired wait.
    #[must_use]
    pub const fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// Checks the ticket against the issuing coordinator and the live
    /// per-cluster write counters.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::TicketStale`] if the ticket belongs to a
    /// different coordinator or any cluster wrote since issuance.
    pub fn validate(
        &self,
        coordinator: Uuid,
        live_counts: &BTreeMap<ClusterName, u64>,
    ) -> Result<(), CoordinatorError> {
        if coordinator != self.coordinator {
            return Err(CoordinatorError::TicketStale {
                reason: "ticket was issued by another coordinator".to_string(),
            });
        }
        for (cluster, count) in live_counts {
            let issued = self.write_counts.get(cluster).copied().unwrap_or(0);
            if *count > issued {
                return Err(CoordinatorError::TicketStale {
                    reason: format!("{cluster} wrote {} time(s) since issuance", count - issued),
                });
            }
        }
        Ok(())
    }
}

/// Which clusters a partial commit reached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitProgress {
    /// Clusters whose pending writes were committed.
    pub committed: Vec<ClusterName>,
    /// Clusters that still hold pending writes.
    pub not_committed: Vec<ClusterName>,
}

impl fmt::Display for CommitProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |v: &[ClusterName]| {
            v.iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(
            f,
            "committed [{}], not committed [{}]",
            join(&self.committed),
            join(&self.not_committed)
        )
    }
}
