//! Replication position markers.
//!
//! [`PositionToken`] is a totally ordered cursor of how far a master has
//! progressed. [`TokenSet`] maps each cluster to one token, captured in a
//! single pass over the active handles.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::ClusterName;

/// Opaque, ordered replication cursor for one cluster.
///
/// `a <= b` means a replica at `a` has observed no more than a replica at `b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PositionToken(u64);

impl PositionToken {
    /// Wraps a raw cursor value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw cursor value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Returns `true` if a replica at `self` has caught up with `target`.
    #[must_use]
    pub fn has_reached(self, target: Self) -> bool {
        self >= target
    }
}

impl fmt::Display for PositionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PositionToken {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Immutable mapping of cluster to master position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenSet(BTreeMap<ClusterName, PositionToken>);

impl TokenSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the position recorded for `cluster`, if any.
    #[must_use]
    pub fn get(&self, cluster: &ClusterName) -> Option<PositionToken> {
        self.0.get(cluster).copied()
    }

    /// Returns `true` if no cluster has a recorded position.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of clusters with a recorded position.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterates over `(cluster, position)` pairs in cluster order.
    pub fn iter(&self) -> impl Iterator<Item = (&ClusterName, PositionToken)> {
        self.0.iter().map(|(k, v)| (k, *v))
    }

    /// Combines two sets, keeping the highest position per cluster.
    #[must_use]
    pub fn merged_with(&self, other: &Self) -> Self {
        let mut out = self.0.clone();
        for (cluster, pos) in &other.0 {
            out.entry(cluster.clone())
                .and_modify(|cur| *cur = (*cur).max(*pos))
                .or_insert(*pos);
        }
        Self(out)
    }
}

impl FromIterator<(ClusterName, PositionToken)> for TokenSet {
    fn from_iter<I: IntoIterator<Item = (ClusterName, PositionToken)>>(iter: I) -> Self {
        let mut map = BTreeMap::new();
        for (cluster, pos) in iter {
            map.entry(cluster)
                .and_modify(|cur: &mut PositionToken| *cur = (*cur).max(pos))
                .or_insert(pos);
        }
        Self(map)
    }
}
