//! Domain layer: identifiers, position tokens, round state and the
//! load balancer collaborator contracts.
//!
//! This module contains the value types shared by every coordinator
//! component: database domains and cluster names, replication position
//! tokens, client identity, transaction round bookkeeping, and the traits
//! that external connection pools implement.

pub mod balancer;
pub mod client;
pub mod cluster;
pub mod position;
pub mod round;

pub use balancer::{HandleId, LbHandle, LoadBalancer, LoadBalancerFactory};
pub use client::{ClientIdentity, RequestInfo};
pub use cluster::{ClusterName, DEFAULT_SECTION, Domain, LbKind};
pub use position::{PositionToken, TokenSet};
pub use round::{CommitProgress, RoundState, RoundTracker, TransactionTicket};
