//! Addon installation onto the target cluster
//!
//! Builders turn cluster configuration into declarative objects; this module
//! reconciles them against the target cluster's own store.

use std::sync::Arc;

use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use keel_common::{ClusterRecord, Error, ProviderConfig};

use crate::reconcile::ensure_all;
use crate::registry::ClusterRegistry;
use crate::store::ManagedObject;

/// Produces the objects of one addon
#[cfg_attr(test, automock)]
pub trait AddonBuilder: Send + Sync {
    /// Addon name for logs
    fn name(&self) -> &'static str;

    /// Objects to reconcile onto the target cluster
    fn build(
        &self,
        config: &ProviderConfig,
        record: &ClusterRecord,
    ) -> Result<Vec<ManagedObject>, Error>;
}

/// An addon whose objects were rendered ahead of time
#[derive(Clone, Debug)]
pub struct StaticAddon {
    name: &'static str,
    objects: Vec<ManagedObject>,
}

impl StaticAddon {
    /// Addon reconciling a fixed object list
    pub fn new(name: &'static str, objects: Vec<ManagedObject>) -> Self {
        Self { name, objects }
    }

    /// Addon with nothing to install
    pub fn empty(name: &'static str) -> Self {
        Self::new(name, Vec::new())
    }
}

impl AddonBuilder for StaticAddon {
    fn name(&self) -> &'static str {
        self.name
    }

    fn build(&self, _: &ProviderConfig, _: &ClusterRecord) -> Result<Vec<ManagedObject>, Error> {
        Ok(self.objects.clone())
    }
}

/// The addon builders a cluster pipeline uses
#[derive(Clone)]
pub struct AddonSet {
    /// kube-proxy
    pub kube_proxy: Arc<dyn AddonBuilder>,
    /// Cluster DNS
    pub dns: Arc<dyn AddonBuilder>,
    /// Flannel CNI
    pub flannel: Arc<dyn AddonBuilder>,
    /// Metrics collector
    pub metrics_server: Arc<dyn AddonBuilder>,
}

impl AddonSet {
    /// Addon set that installs nothing
    pub fn empty() -> Self {
        Self {
            kube_proxy: Arc::new(StaticAddon::empty("kube-proxy")),
            dns: Arc::new(StaticAddon::empty("coredns")),
            flannel: Arc::new(StaticAddon::empty("flannel")),
            metrics_server: Arc::new(StaticAddon::empty("metrics-server")),
        }
    }
}

/// Reconcile the builders' objects onto the record's target cluster
///
/// Returns `Ok(false)` without touching anything when the target cluster
/// is not reachable yet.
pub async fn apply_addons(
    registry: &dyn ClusterRegistry,
    config: &ProviderConfig,
    record: &ClusterRecord,
    builders: &[&dyn AddonBuilder],
) -> Result<bool, Error> {
    let name = record.name();
    let target = match registry.get(&name).await {
        Ok(target) => target,
        Err(e) if e.is_not_ready() => {
            debug!(cluster = %name, error = %e, "target cluster not ready, skipping addons");
            return Ok(false);
        }
        Err(e) => return Err(e),
    };

    for builder in builders {
        let objects = builder.build(config, record)?;
        ensure_all(target.store.as_ref(), &objects).await?;
        info!(
            cluster = %name,
            addon = builder.name(),
            objects = objects.len(),
            "addon reconciled"
        );
    }
    Ok(true)
}
