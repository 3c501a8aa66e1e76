//! Service layer: the request-scoped coordinator and its collaborators.
//!
//! [`LbCoordinator`] is the facade callers use. It delegates handle caching
//! to [`LbRegistry`], read-your-writes bookkeeping to
//! [`ChronologyProtector`] and replica catch-up to [`ReplicationWaiter`].

pub mod cancel;
pub mod chronology;
pub mod coordinator;
pub mod listeners;
pub mod registry;
pub mod replication;

pub use cancel::{CancelSource, Cancellation};
pub use chronology::{ChronologyProtector, ChronologySettings, PersistOutcome, append_position_time};
pub use coordinator::{CommitOptions, LbCoordinator, ShutdownReport};
pub use listeners::{ReplicationListener, ReplicationListeners};
pub use registry::{LbRegistry, Lookup};
pub use replication::{ReplicationWaiter, WaitOptions, WaitResult};
