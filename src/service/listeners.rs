//! Named hooks run before every replication wait.

use std::fmt;
use std::sync::Arc;

use crate::error::CoordinatorError;

/// Callback run before a replication wait. It must not leave master writes
/// pending.
pub type ReplicationListener = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// Ordered list of named listeners owned by one coordinator.
#[derive(Default, Clone)]
pub struct ReplicationListeners {
    entries: Vec<(String, ReplicationListener)>,
}

impl fmt::Debug for ReplicationListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(name, _)| name))
            .finish()
    }
}

impl ReplicationListeners {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds, replaces (keeping its position) or, with `None`, removes the
    /// listener called `name`.
    pub fn set(&mut self, name: &str, listener: Option<ReplicationListener>) {
        let existing = self.entries.iter().position(|(n, _)| n == name);
        match (existing, listener) {
            (Some(idx), Some(listener)) => {
                if let Some(slot) = self.entries.get_mut(idx) {
                    slot.1 = listener;
                }
            }
            (Some(idx), None) => {
                self.entries.remove(idx);
            }
            (None, Some(listener)) => self.entries.push((name.to_string(), listener)),
            (None, None) => {}
        }
    }

    /// Listener names in invocation order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no listener is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Runs every listener in registration order, stopping at the first
    /// failure.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Listener`] wrapping the failing
    /// listener's error.
    pub fn run(&self) -> Result<(), CoordinatorError> {
        for (name, listener) in &self.entries {
            listener().map_err(|source| CoordinatorError::Listener {
                name: name.clone(),
                source,
            })?;
        }
        Ok(())
    }
}
