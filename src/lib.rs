//! # chronoguard
//!
//! Consistency coordinator for replicated databases.
//!
//! A request creates one [`service::LbCoordinator`]. Through it the request
//! obtains load balancer handles for the clusters it uses, groups its
//! master writes into a transaction round, and, at the end, records the
//! master positions it reached so the same client's next request (possibly
//! on another server) waits for replicas to catch up before reading.
//! Connection pools and the position cache are external collaborators,
//! modelled by the [`domain::LoadBalancer`] and [`persistence::TokenStore`]
//! traits.
//!
//! ## Architecture
//!
//! ```text
//! Request
//!     │
//!     ├── LbCoordinator (service/)
//!     │     ├── RoundTracker (domain/)
//!     │     ├── ReplicationListeners
//!     │     └── ReplicationWaiter
//!     │
//!     ├── LbRegistry (service/)
//!     │     └── LoadBalancerFactory ─► LoadBalancer (external, or sim/)
//!     │
//!     └── ChronologyProtector (service/)
//!           └── TokenStore (persistence/)
//! ```

pub mod config;
pub mod domain;
pub mod error;
pub mod persistence;
pub mod service;
pub mod sim;
