//! Custom Resource Definitions for keel
//!
//! This module contains the Cluster and Machine CRDs and the in-memory
//! [`ClusterRecord`] the provisioning phases operate on.

mod cluster;
mod machine;
mod types;

use kube::ResourceExt;

pub use cluster::{Cluster, ClusterPhase, ClusterSpec, ClusterStatus};
pub use machine::{Machine, MachinePhase, MachineSpec, MachineStatus};
pub use types::{
    AddressType, ClusterAddress, ClusterFeatures, ClusterProperties, Condition, ConditionStatus,
    FileSpec, HaSpec, HookType, MachineInfo, SelfManagedHa, SshSpec, ThirdPartyHa,
    NODE_CNI_HOOK,
};

use crate::credential::ClusterCredential;
use crate::DEFAULT_API_PORT;

/// A cluster together with its derived credential material
///
/// Phases receive the record through a single `&mut` handle; the caller
/// persists it after each pipeline run.
#[derive(Clone, Debug)]
pub struct ClusterRecord {
    /// The declared cluster and its observed status
    pub cluster: Cluster,
    /// Secret material derived for the cluster
    pub credential: ClusterCredential,
}

impl ClusterRecord {
    /// Wrap a cluster with an empty credential
    pub fn new(cluster: Cluster) -> Self {
        Self {
            cluster,
            credential: ClusterCredential::default(),
        }
    }

    /// Cluster name
    pub fn name(&self) -> String {
        self.cluster.name_any()
    }

    /// Cluster namespace, falling back to the cluster name
    pub fn namespace(&self) -> String {
        self.cluster.namespace().unwrap_or_else(|| self.name())
    }

    /// Declared spec
    pub fn spec(&self) -> &ClusterSpec {
        &self.cluster.spec
    }

    /// Observed status, or an empty one when none was recorded yet
    pub fn status(&self) -> ClusterStatus {
        self.cluster.status.clone().unwrap_or_default()
    }

    /// Mutable observed status, created on first access
    pub fn status_mut(&mut self) -> &mut ClusterStatus {
        self.cluster.status.get_or_insert_with(ClusterStatus::default)
    }

    /// Known API server addresses
    pub fn addresses(&self) -> &[ClusterAddress] {
        self.cluster
            .status
            .as_ref()
            .map(|s| s.addresses.as_slice())
            .unwrap_or(&[])
    }

    /// Register an address, ignoring exact duplicates
    pub fn add_address(&mut self, type_: AddressType, host: impl Into<String>, port: u16) {
        let address = ClusterAddress::new(type_, host, port);
        let addresses = &mut self.status_mut().addresses;
        if !addresses.contains(&address) {
            addresses.push(address);
        }
    }

    /// Port clients use to reach the API server
    pub fn bind_port(&self) -> u16 {
        self.spec()
            .features
            .third_party_ha()
            .map(|ha| ha.vport)
            .unwrap_or(DEFAULT_API_PORT)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    /// A three-machine cluster without HA
    pub fn sample_cluster(name: &str) -> Cluster {
        Cluster {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(name.to_string()),
                ..Default::default()
            },
            spec: ClusterSpec {
                version: "1.32.0".to_string(),
                cluster_cidr: "10.0.0.0/16".to_string(),
                service_cidr: None,
                dns_domain: "cluster.local".to_string(),
                properties: ClusterProperties {
                    max_node_pod_num: 64,
                    max_cluster_service_num: 4096,
                },
                machines: ["192.168.1.10", "192.168.1.11", "192.168.1.12"]
                    .iter()
                    .map(|ip| MachineInfo {
                        ip: ip.to_string(),
                        password: Some("pw".to_string()),
                        ..Default::default()
                    })
                    .collect(),
                features: ClusterFeatures::default(),
                public_alternative_names: Vec::new(),
                tenant_id: None,
            },
            status: None,
        }
    }
}
