//! Coordinator configuration loaded from environment variables.
//!
//! Follows 12-factor style: all settings come from environment variables
//! (or a `.env` file via `dotenvy`). Every registry carries its own
//! [`CoordinatorConfig`]; nothing here is process-global.

use std::time::Duration;

use crate::domain::Domain;
use crate::error::CoordinatorError;

/// What `shutdown` does with chronology positions.
///
/// Persisted as a small integer in process configuration (`SHUTDOWN_MODE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ShutdownMode {
    /// Do not capture positions.
    NoChronologyProtection = 0,
    /// Capture and persist without waiting.
    Async = 1,
    /// Capture, persist, and wait (bounded) for the store to confirm.
    #[default]
    Sync = 2,
}

impl TryFrom<u8> for ShutdownMode {
    type Error = CoordinatorError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::NoChronologyProtection),
            1 => Ok(Self::Async),
            2 => Ok(Self::Sync),
            other => Err(CoordinatorError::Configuration(format!(
                "invalid shutdown mode {other}; expected 0, 1 or 2"
            ))),
        }
    }
}

/// Per-registry coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Domain used when callers ask for the main balancer without one.
    pub local_domain: Domain,

    /// Default bound on replication waits; also the default "recent" window
    /// of `has_or_made_recent_master_changes`.
    pub replication_wait_timeout: Duration,

    /// Interval between replica position polls.
    pub replication_poll_interval: Duration,

    /// Default cap on cumulative write time per commit (`None` = unbounded).
    pub max_write_duration: Option<Duration>,

    /// Lifetime of persisted chronology positions.
    pub chronology_ttl: Duration,

    /// Bound on a synchronous chronology write.
    pub chronology_persist_timeout: Duration,

    /// Bound on waiting for a record at least as new as the client's
    /// position time.
    pub chronology_restore_wait: Duration,

    /// Namespace prefix of chronology store keys.
    pub chronology_key_prefix: String,

    /// Mode used by the surrounding process at request end.
    pub shutdown_mode: ShutdownMode,

    /// Agent name propagated to balancers for query attribution.
    pub agent_name: Option<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            local_domain: Domain::default(),
            replication_wait_timeout: Duration::from_secs(60),
            replication_poll_interval: Duration::from_millis(10),
            max_write_duration: None,
            chronology_ttl: Duration::from_secs(60),
            chronology_persist_timeout: Duration::from_millis(1000),
            chronology_restore_wait: Duration::from_millis(2000),
            chronology_key_prefix: "chronology".to_string(),
            shutdown_mode: ShutdownMode::Sync,
            agent_name: None,
        }
    }
}

impl CoordinatorConfig {
    /// Loads configuration from environment variables.
    ///
    /// Falls back to defaults when a variable is missing or unparsable.
    /// Calls `dotenvy::dotenv().ok()` to optionally load a `.env` file.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Configuration`] if `SHUTDOWN_MODE` is set
    /// to an unknown value or the result fails [`Self::validate`].
    pub fn from_env() -> Result<Self, CoordinatorError> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let local_domain = Domain::new(
            std::env::var("DB_NAME").unwrap_or_else(|_| "default".to_string()),
            std::env::var("DB_SCHEMA").ok(),
            std::env::var("DB_PREFIX").unwrap_or_default(),
        );

        let shutdown_mode = match std::env::var("SHUTDOWN_MODE").ok() {
            Some(raw) => {
                let value: u8 = raw.trim().parse().map_err(|_| {
                    CoordinatorError::Configuration(format!(
                        "SHUTDOWN_MODE is not an integer: {raw:?}"
                    ))
                })?;
                ShutdownMode::try_from(value)?
            }
            None => defaults.shutdown_mode,
        };

        let config = Self {
            local_domain,
            replication_wait_timeout: Duration::from_secs(parse_env(
                "REPLICATION_WAIT_TIMEOUT_SECS",
                defaults.replication_wait_timeout.as_secs(),
            )),
            replication_poll_interval: Duration::from_millis(parse_env(
                "REPLICATION_POLL_INTERVAL_MS",
                10,
            )),
            max_write_duration: std::env::var("MAX_WRITE_DURATION_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis),
            chronology_ttl: Duration::from_secs(parse_env(
                "CHRONOLOGY_TTL_SECS",
                defaults.chronology_ttl.as_secs(),
            )),
            chronology_persist_timeout: Duration::from_millis(parse_env(
                "CHRONOLOGY_PERSIST_TIMEOUT_MS",
                1000,
            )),
            chronology_restore_wait: Duration::from_millis(parse_env(
                "CHRONOLOGY_RESTORE_WAIT_MS",
                2000,
            )),
            chronology_key_prefix: std::env::var("CHRONOLOGY_KEY_PREFIX")
                .unwrap_or(defaults.chronology_key_prefix),
            shutdown_mode,
            agent_name: std::env::var("AGENT_NAME").ok().filter(|s| !s.is_empty()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks values that would make the coordinator misbehave.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Configuration`] describing the first bad
    /// value.
    pub fn validate(&self) -> Result<(), CoordinatorError> {
        if self.replication_poll_interval.is_zero() {
            return Err(CoordinatorError::Configuration(
                "replication poll interval must be positive".to_string(),
            ));
        }
        if self.chronology_ttl.is_zero() {
            return Err(CoordinatorError::Configuration(
                "chronology TTL must be positive".to_string(),
            ));
        }
        if self.chronology_key_prefix.is_empty() {
            return Err(CoordinatorError::Configuration(
                "chronology key prefix must not be empty".to_string(),
            ));
        }
        if self.local_domain.database_name().is_empty() {
            return Err(CoordinatorError::Configuration(
                "local domain needs a database name".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parses an environment variable as `T`, returning `default` on missing
/// or invalid values.
fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
