//! Simulated clusters implementing the load balancer contracts in memory.
//!
//! A [`SimCluster`] is the shared physical state (master and replica
//! positions) that several requests observe. Each [`SimLoadBalancer`] is one
//! request's connection pool onto a cluster, with its own pending writes.
//! [`SimFactory`] hands out balancers the way a real factory would and keeps
//! the ones it built so callers can drive writes through them.

pub mod cluster;
pub mod factory;

pub use cluster::{SimCluster, SimLoadBalancer};
pub use factory::SimFactory;
