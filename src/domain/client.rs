//! Client identity used to key persisted chronology positions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Request facts supplied by the HTTP layer (or a CLI wrapper).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestInfo {
    /// Client IP address as seen by the application server.
    pub ip_address: String,
    /// Client `User-Agent` string.
    pub user_agent: String,
    /// Whether chronology protection applies to this request at all.
    pub chronology_protection: bool,
    /// Explicit client id carried by the transport (e.g. a cookie). Takes
    /// precedence over the derived id.
    pub client_id: Option<String>,
    /// Time the previous request from this client persisted its positions,
    /// if the transport carried it (`cpPosTime`).
    pub position_time: Option<DateTime<Utc>>,
}

impl RequestInfo {
    /// Request info for a client identified only by IP and agent.
    #[must_use]
    pub fn new(ip_address: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            ip_address: ip_address.into(),
            user_agent: user_agent.into(),
            chronology_protection: true,
            client_id: None,
            position_time: None,
        }
    }

    /// Request info for command-line work, where there is no remote client.
    #[must_use]
    pub fn cli() -> Self {
        Self::new("127.0.0.1", "cli")
    }

    /// Parses a `cpPosTime` value (UNIX seconds, fractional part allowed).
    ///
    /// Returns `None` for anything that is not a finite, non-negative number.
    #[must_use]
    pub fn parse_position_time(value: &str) -> Option<DateTime<Utc>> {
        let secs: f64 = value.trim().parse().ok()?;
        if !secs.is_finite() || secs < 0.0 {
            return None;
        }
        #[allow(clippy::cast_possible_truncation)]
        let micros = (secs * 1_000_000.0).round() as i64;
        DateTime::from_timestamp_micros(micros)
    }

    /// Identity derived from this request.
    #[must_use]
    pub fn identity(&self) -> ClientIdentity {
        let id = match &self.client_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => {
                let seed = format!("{}\n{}", self.ip_address, self.user_agent);
                Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes()).to_string()
            }
        };
        ClientIdentity(id)
    }
}

impl Default for RequestInfo {
    fn default() -> Self {
        Self::cli()
    }
}

/// Opaque cache-key component identifying one client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    /// Returns the identity string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Store key for this client under the given namespace prefix.
    #[must_use]
    pub fn store_key(&self, prefix: &str) -> String {
        format!("{prefix}:{}", self.0)
    }
}
