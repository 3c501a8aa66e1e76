//! Per-request cache of load balancer handles.
//!
//! [`LbRegistry`] stores one balancer per [`ClusterName`] behind a
//! [`tokio::sync::RwLock`]. Handles are created lazily on first request,
//! kept in registration order (so fan-out is deterministic), and revoked in
//! bulk by [`LbRegistry::destroy`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::RwLock;

use crate::domain::{
    ClusterName, Domain, HandleId, LbHandle, LbKind, LoadBalancer, LoadBalancerFactory,
};
use crate::error::CoordinatorError;

#[derive(Debug)]
struct Slot {
    id: HandleId,
    cluster: ClusterName,
    balancer: Arc<dyn LoadBalancer>,
}

/// Result of [`LbRegistry::get_or_create`].
#[derive(Debug)]
pub struct Lookup {
    /// The tracked handle, scoped to the requested domain.
    pub handle: LbHandle,
    /// `true` if the balancer was created by this call.
    pub created: bool,
}

/// Cache of tracked balancers, keyed by cluster.
///
/// # Concurrency
///
/// - Lookups of existing handles take the read lock.
/// - Create-or-fetch takes the write lock, so two concurrent callers never
///   build two balancers for one cluster.
/// - Handle use itself is not synchronized here.
#[derive(Debug)]
pub struct LbRegistry {
    factory: Arc<dyn LoadBalancerFactory>,
    slots: RwLock<Vec<Slot>>,
    revoked: Arc<AtomicBool>,
    next_id: AtomicU64,
}

impl LbRegistry {
    /// Creates an empty registry over `factory`.
    #[must_use]
    pub fn new(factory: Arc<dyn LoadBalancerFactory>) -> Self {
        Self {
            factory,
            slots: RwLock::new(Vec::new()),
            revoked: Arc::new(AtomicBool::new(false)),
            next_id: AtomicU64::new(1),
        }
    }

    /// Fails once the registry has been destroyed.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::AccessAfterDestroy`] after
    /// [`Self::destroy`].
    pub fn ensure_live(&self, operation: &'static str) -> Result<(), CoordinatorError> {
        if self.revoked.load(Ordering::Acquire) {
            return Err(CoordinatorError::AccessAfterDestroy { operation });
        }
        Ok(())
    }

    /// Returns `true` once [`Self::destroy`] has run.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }

    /// Cluster that serves `kind` for `domain`.
    #[must_use]
    pub fn resolve(&self, kind: &LbKind, domain: &Domain) -> ClusterName {
        match kind {
            LbKind::Main => ClusterName::Core(self.factory.section_for(domain)),
            LbKind::External(name) => ClusterName::External(name.clone()),
        }
    }

    /// Returns the cached handle for the resolved cluster, creating and
    /// registering one if needed.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::AccessAfterDestroy`] after destroy, or
    /// [`CoordinatorError::HandleCreation`] if the factory fails.
    pub async fn get_or_create(
        &self,
        kind: &LbKind,
        domain: &Domain,
    ) -> Result<Lookup, CoordinatorError> {
        self.ensure_live("get load balancer")?;
        let cluster = self.resolve(kind, domain);

        if let Some(handle) = self.find(&cluster, domain).await {
            return Ok(Lookup {
                handle,
                created: false,
            });
        }

        let mut slots = self.slots.write().await;
        self.ensure_live("get load balancer")?;
        // Another caller may have won the race between the two locks.
        if let Some(slot) = slots.iter().find(|s| s.cluster == cluster) {
            return Ok(Lookup {
                handle: self.tracked_handle(slot, domain),
                created: false,
            });
        }
        let balancer = self.build(&cluster, domain)?;
        let slot = Slot {
            id: self.allocate_id(),
            cluster,
            balancer,
        };
        let handle = self.tracked_handle(&slot, domain);
        tracing::debug!(cluster = %slot.cluster, id = %slot.id, "load balancer created");
        slots.push(slot);
        Ok(Lookup {
            handle,
            created: true,
        })
    }

    /// Creates a balancer the registry never tracks; the caller owns it and
    /// must close it with [`LbHandle::close`].
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::AccessAfterDestroy`] after destroy, or
    /// [`CoordinatorError::HandleCreation`] if the factory fails.
    pub fn create_untracked(
        &self,
        kind: &LbKind,
        domain: &Domain,
    ) -> Result<LbHandle, CoordinatorError> {
        self.ensure_live("create load balancer")?;
        let cluster = self.resolve(kind, domain);
        let balancer = self.build(&cluster, domain)?;
        Ok(LbHandle::untracked(
            self.allocate_id(),
            cluster,
            domain.clone(),
            balancer,
        ))
    }

    /// Snapshot of all tracked handles in registration order. Each handle is
    /// scoped to `domain`.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::AccessAfterDestroy`] after destroy.
    pub async fn active(&self, domain: &Domain) -> Result<Vec<LbHandle>, CoordinatorError> {
        self.ensure_live("iterate load balancers")?;
        let slots = self.slots.read().await;
        Ok(slots.iter().map(|s| self.tracked_handle(s, domain)).collect())
    }

    /// Number of tracked handles.
    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    /// Returns `true` if no handle is tracked.
    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }

    /// Closes connections on every tracked balancer; the registry stays
    /// usable.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::AccessAfterDestroy`] after destroy.
    pub async fn close_all(&self) -> Result<(), CoordinatorError> {
        self.ensure_live("close load balancers")?;
        for slot in self.slots.read().await.iter() {
            slot.balancer.close_all();
        }
        Ok(())
    }

    /// Disables every tracked balancer, revokes all handles and drops the
    /// cache. Terminal and idempotent.
    pub async fn destroy(&self) {
        if self.revoked.swap(true, Ordering::AcqRel) {
            return;
        }
        let slots: Vec<Slot> = self.slots.write().await.drain(..).collect();
        for slot in &slots {
            slot.balancer.disable();
        }
        tracing::info!(handles = slots.len(), "load balancer registry destroyed");
    }

    async fn find(&self, cluster: &ClusterName, domain: &Domain) -> Option<LbHandle> {
        let slots = self.slots.read().await;
        slots
            .iter()
            .find(|s| &s.cluster == cluster)
            .map(|s| self.tracked_handle(s, domain))
    }

    fn build(
        &self,
        cluster: &ClusterName,
        domain: &Domain,
    ) -> Result<Arc<dyn LoadBalancer>, CoordinatorError> {
        let built = match cluster {
            ClusterName::Core(section) => self.factory.new_main(section, domain),
            ClusterName::External(name) => self.factory.new_external(name),
        };
        built.map_err(|source| CoordinatorError::HandleCreation {
            cluster: cluster.clone(),
            source,
        })
    }

    fn tracked_handle(&self, slot: &Slot, domain: &Domain) -> LbHandle {
        LbHandle::tracked(
            slot.id,
            slot.cluster.clone(),
            domain.clone(),
            Arc::clone(&slot.balancer),
            Arc::clone(&self.revoked),
        )
    }

    fn allocate_id(&self) -> HandleId {
        HandleId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::sim::{SimCluster, SimFactory};

    fn make_registry() -> (LbRegistry, Arc<SimFactory>) {
        let factory = Arc::new(
            SimFactory::new()
                .with_cluster(SimCluster::new(ClusterName::main(), &["r1"]))
                .with_cluster(SimCluster::new(
                    ClusterName::External("blobs".to_string()),
                    &["b1"],
                )),
        );
        let dyn_factory = Arc::clone(&factory) as Arc<dyn LoadBalancerFactory>;
        (LbRegistry::new(dyn_factory), factory)
    }

    #[tokio::test]
    async fn same_key_returns_same_handle() {
        let (registry, _) = make_registry();
        let domain = Domain::database("wiki");
        let Ok(a) = registry.get_or_create(&LbKind::Main, &domain).await else {
            panic!("creation failed");
        };
        let Ok(b) = registry.get_or_create(&LbKind::Main, &domain).await else {
            panic!("lookup failed");
        };
        assert!(a.created);
        assert!(!b.created);
        assert_eq!(a.handle.id(), b.handle.id());
        assert!(a.handle.same_balancer(&b.handle));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn domains_on_one_section_share_balancer() {
        let (registry, _) = make_registry();
        let Ok(a) = registry.get_or_create(&LbKind::Main, &Domain::database("a")).await else {
            panic!("creation failed");
        };
        let Ok(b) = registry.get_or_create(&LbKind::Main, &Domain::database("b")).await else {
            panic!("lookup failed");
        };
        assert!(a.handle.same_balancer(&b.handle));
        assert_eq!(b.handle.domain().database_name(), "b");
    }

    #[tokio::test]
    async fn active_keeps_registration_order() {
        let (registry, _) = make_registry();
        let domain = Domain::database("wiki");
        let _ = registry
            .get_or_create(&LbKind::External("blobs".to_string()), &domain)
            .await;
        let _ = registry.get_or_create(&LbKind::Main, &domain).await;
        let Ok(active) = registry.active(&domain).await else {
            panic!("iteration failed");
        };
        let clusters: Vec<_> = active.iter().map(|h| h.cluster().clone()).collect();
        assert_eq!(
            clusters,
            vec![ClusterName::External("blobs".to_string()), ClusterName::main()]
        );
    }

    #[tokio::test]
    async fn untracked_handles_are_not_active() {
        let (registry, _) = make_registry();
        let domain = Domain::database("wiki");
        let Ok(handle) = registry.create_untracked(&LbKind::Main, &domain) else {
            panic!("creation failed");
        };
        assert!(!handle.is_tracked());
        assert!(registry.is_empty().await);
        assert!(handle.close().is_ok());
        assert!(matches!(
            handle.balancer(),
            Err(CoordinatorError::AccessAfterDestroy { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_external_cluster_fails() {
        let (registry, _) = make_registry();
        let res = registry
            .get_or_create(&LbKind::External("nope".to_string()), &Domain::default())
            .await;
        assert!(matches!(res, Err(CoordinatorError::HandleCreation { .. })));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn destroy_revokes_handles_and_is_idempotent() {
        let (registry, factory) = make_registry();
        let domain = Domain::database("wiki");
        let Ok(lookup) = registry.get_or_create(&LbKind::Main, &domain).await else {
            panic!("creation failed");
        };
        registry.destroy().await;
        registry.destroy().await;
        assert!(registry.is_destroyed());
        assert!(lookup.handle.balancer().is_err());
        assert!(matches!(
            registry.get_or_create(&LbKind::Main, &domain).await,
            Err(CoordinatorError::AccessAfterDestroy { .. })
        ));
        let Some(lb) = factory.latest(&ClusterName::main()) else {
            panic!("factory built nothing");
        };
        assert!(lb.is_disabled());
    }

    #[tokio::test]
    async fn close_all_keeps_registry_usable() {
        let (registry, factory) = make_registry();
        let domain = Domain::database("wiki");
        let _ = registry.get_or_create(&LbKind::Main, &domain).await;
        assert!(registry.close_all().await.is_ok());
        let Some(lb) = factory.latest(&ClusterName::main()) else {
            panic!("factory built nothing");
        };
        assert_eq!(lb.close_count(), 1);
        assert!(registry
            .get_or_create(&LbKind::External("blobs".to_string()), &domain)
            .await
            .is_ok());
        assert_eq!(registry.len().await, 2);
    }
}
