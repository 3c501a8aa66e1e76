//! Stored chronology records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::TokenSet;
use crate::error::CoordinatorError;

/// One client's persisted chronology state.
///
/// Stored as JSON under the client's key with a TTL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPositions {
    /// Master position per cluster at the end of the client's last request.
    pub positions: TokenSet,
    /// Last master write time per master server name.
    #[serde(default)]
    pub touched: BTreeMap<String, DateTime<Utc>>,
    /// When the record was written.
    pub written_at: Option<DateTime<Utc>>,
}

impl StoredPositions {
    /// Returns `true` if the record holds no positions and no touches.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty() && self.touched.is_empty()
    }

    /// Returns `true` if the record was written more than `ttl` before `now`.
    ///
    /// Records without a write time are never fresh.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: std::time::Duration) -> bool {
        let Some(written_at) = self.written_at else {
            return true;
        };
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now.signed_duration_since(written_at) > ttl,
            Err(_) => false,
        }
    }

    /// Encodes the record as stored by cache backends.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Serialization`] if encoding fails.
    pub fn to_json(&self) -> Result<String, CoordinatorError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a record written by [`Self::to_json`].
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Serialization`] for malformed input.
    pub fn from_json(raw: &str) -> Result<Self, CoordinatorError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Combines two records: highest position per cluster, latest touch per
    /// server, latest write time.
    #[must_use]
    pub fn merged_with(&self, other: &Self) -> Self {
        let mut touched = self.touched.clone();
        for (server, at) in &other.touched {
            touched
                .entry(server.clone())
                .and_modify(|cur| *cur = (*cur).max(*at))
                .or_insert(*at);
        }
        Self {
            positions: self.positions.merged_with(&other.positions),
            touched,
            written_at: self.written_at.max(other.written_at),
        }
    }
}
