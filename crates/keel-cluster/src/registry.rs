//! Target cluster registry
//!
//! Addon, mark-node and node-ready phases talk to the cluster being built,
//! not the management cluster. The registry hands out a [`TargetCluster`]
//! once that cluster's API server is reachable and answers
//! `Error::NotReady` until then.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use keel_common::kube_utils::is_control_plane_node;
use keel_common::Error;

use crate::store::{KubeStore, NodeApi, ObjectStore};

/// Clients for one target cluster
#[derive(Clone)]
pub struct TargetCluster {
    /// Cluster name
    pub name: String,
    /// Object access
    pub store: Arc<dyn ObjectStore>,
    /// Node access
    pub nodes: Arc<dyn NodeApi>,
}

impl TargetCluster {
    /// Target cluster backed by a single kube client
    pub fn from_client(name: impl Into<String>, client: Client) -> Self {
        let store = Arc::new(KubeStore::new(client));
        Self {
            name: name.into(),
            store: store.clone(),
            nodes: store,
        }
    }

    /// Connect using a kubeconfig document
    pub async fn from_kubeconfig(name: impl Into<String>, kubeconfig: &str) -> Result<Self, Error> {
        let name = name.into();
        let kubeconfig = Kubeconfig::from_yaml(kubeconfig).map_err(|e| {
            Error::configuration_for(&name, format!("invalid kubeconfig: {}", e))
        })?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::configuration_for(&name, format!("kubeconfig rejected: {}", e)))?;
        let client = Client::try_from(config)?;
        Ok(Self::from_client(name, client))
    }
}

impl std::fmt::Debug for TargetCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetCluster")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Looks up clients for target clusters
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterRegistry: Send + Sync {
    /// Clients for `cluster`
    ///
    /// `Error::NotReady` means the cluster is not reachable yet and the
    /// caller should come back later. Any other error is a real failure.
    async fn get(&self, cluster: &str) -> Result<TargetCluster, Error>;
}

/// Registry of explicitly registered target clusters
#[derive(Default)]
pub struct StaticRegistry {
    clusters: DashMap<String, TargetCluster>,
}

impl StaticRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a target cluster
    pub fn insert(&self, target: TargetCluster) {
        debug!(cluster = %target.name, "registering target cluster");
        self.clusters.insert(target.name.clone(), target);
    }

    /// Forget a target cluster
    pub fn remove(&self, cluster: &str) -> Option<TargetCluster> {
        self.clusters.remove(cluster).map(|(_, target)| target)
    }
}

#[async_trait]
impl ClusterRegistry for StaticRegistry {
    async fn get(&self, cluster: &str) -> Result<TargetCluster, Error> {
        self.clusters
            .get(cluster)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::not_ready(cluster, "no client registered"))
    }
}

/// Node totals of a target cluster
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeCounts {
    /// Nodes carrying a control-plane role label
    pub masters: usize,
    /// Every other node
    pub workers: usize,
}

/// Count control-plane and worker nodes
pub async fn count_nodes(target: &TargetCluster) -> Result<NodeCounts, Error> {
    let nodes = target.nodes.list_nodes().await?;
    let masters = nodes.iter().filter(|n| is_control_plane_node(n)).count();
    Ok(NodeCounts {
        masters,
        workers: nodes.len() - masters,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::Node;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use keel_common::kube_utils::MASTER_ROLE_LABEL;

    use super::*;
    use crate::store::MemoryStore;

    fn memory_target(name: &str) -> (TargetCluster, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let target = TargetCluster {
            name: name.to_string(),
            store: store.clone(),
            nodes: store.clone(),
        };
        (target, store)
    }

    #[tokio::test]
    async fn unknown_cluster_is_not_ready() {
        let registry = StaticRegistry::new();
        let err = registry.get("c1").await.unwrap_err();
        assert!(err.is_not_ready());

        let (target, _) = memory_target("c1");
        registry.insert(target);
        assert_eq!(registry.get("c1").await.unwrap().name, "c1");

        registry.remove("c1");
        assert!(registry.get("c1").await.unwrap_err().is_not_ready());
    }

    #[tokio::test]
    async fn counts_masters_by_role_label() {
        let (target, store) = memory_target("c1");
        for (name, master) in [("10.0.0.1", true), ("10.0.0.2", false), ("10.0.0.3", false)] {
            let labels = master
                .then(|| BTreeMap::from([(MASTER_ROLE_LABEL.to_string(), String::new())]));
            store.insert_node(Node {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    labels,
                    ..Default::default()
                },
                ..Default::default()
            });
        }

        let counts = count_nodes(&target).await.unwrap();
        assert_eq!(counts, NodeCounts { masters: 1, workers: 2 });
    }

    #[tokio::test]
    async fn malformed_kubeconfig_is_a_configuration_error() {
        let err = TargetCluster::from_kubeconfig("c1", "clusters: [").await.unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }
}
