//! Factory producing simulated balancers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{SimCluster, SimLoadBalancer};
use crate::domain::{ClusterName, DEFAULT_SECTION, Domain, LoadBalancer, LoadBalancerFactory};

/// Factory over a fixed set of [`SimCluster`]s.
///
/// Domains map to the `DEFAULT` section unless assigned another one with
/// [`SimFactory::with_section`]. Every balancer built is remembered so
/// callers can issue writes through it.
#[derive(Debug, Default)]
pub struct SimFactory {
    clusters: HashMap<ClusterName, Arc<SimCluster>>,
    sections: HashMap<String, String>,
    built: Mutex<Vec<Arc<SimLoadBalancer>>>,
}

impl SimFactory {
    /// Creates a factory with no clusters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a cluster.
    #[must_use]
    pub fn with_cluster(mut self, cluster: Arc<SimCluster>) -> Self {
        self.clusters.insert(cluster.name().clone(), cluster);
        self
    }

    /// Assigns the database `database` to core section `section`.
    #[must_use]
    pub fn with_section(mut self, database: &str, section: &str) -> Self {
        self.sections.insert(database.to_string(), section.to_string());
        self
    }

    /// Most recently built balancer for `name`.
    #[must_use]
    pub fn latest(&self, name: &ClusterName) -> Option<Arc<SimLoadBalancer>> {
        self.built
            .lock()
            .iter()
            .rev()
            .find(|lb| lb.cluster().name() == name)
            .map(Arc::clone)
    }

    /// Number of balancers built so far.
    #[must_use]
    pub fn built_count(&self) -> usize {
        self.built.lock().len()
    }

    fn build(&self, name: &ClusterName) -> anyhow::Result<Arc<dyn LoadBalancer>> {
        let Some(cluster) = self.clusters.get(name) else {
            anyhow::bail!("no such cluster: {name}");
        };
        let lb = Arc::new(SimLoadBalancer::new(Arc::clone(cluster)));
        self.built.lock().push(Arc::clone(&lb));
        Ok(lb)
    }
}

impl LoadBalancerFactory for SimFactory {
    fn section_for(&self, domain: &Domain) -> String {
        self.sections
            .get(domain.database_name())
            .cloned()
            .unwrap_or_else(|| DEFAULT_SECTION.to_string())
    }

    fn new_main(&self, section: &str, _domain: &Domain) -> anyhow::Result<Arc<dyn LoadBalancer>> {
        self.build(&ClusterName::Core(section.to_string()))
    }

    fn new_external(&self, cluster: &str) -> anyhow::Result<Arc<dyn LoadBalancer>> {
        self.build(&ClusterName::External(cluster.to_string()))
    }
}
