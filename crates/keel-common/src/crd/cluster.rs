//! Cluster Custom Resource Definition
//!
//! A Cluster declares a hosted Kubernetes cluster: its version, networking
//! capacity, machines and optional HA front ends. The status carries the
//! facts derived before any infrastructure exists.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ClusterAddress, ClusterFeatures, ClusterProperties, Condition, MachineInfo};

/// Specification for a Cluster
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "devops.keel.io",
    version = "v1",
    kind = "Cluster",
    plural = "clusters",
    status = "ClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Kubernetes version (e.g., "1.32.0")
    pub version: String,

    /// Pod network CIDR
    #[serde(rename = "clusterCIDR")]
    pub cluster_cidr: String,

    /// Explicit service CIDR; derived from the cluster CIDR when absent
    #[serde(rename = "serviceCIDR", default, skip_serializing_if = "Option::is_none")]
    pub service_cidr: Option<String>,

    /// Cluster DNS domain
    #[serde(default = "default_dns_domain")]
    pub dns_domain: String,

    /// Capacity properties
    #[serde(default)]
    pub properties: ClusterProperties,

    /// Machines forming the cluster
    #[serde(default)]
    pub machines: Vec<MachineInfo>,

    /// Optional features (HA, hooks, files)
    #[serde(default)]
    pub features: ClusterFeatures,

    /// Extra names for the API server; the first one is the join target when set
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub public_alternative_names: Vec<String>,

    /// Tenant owning the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

fn default_dns_domain() -> String {
    "cluster.local".to_string()
}

/// Lifecycle phase of a cluster
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ClusterPhase {
    /// Declared, not yet derived
    #[default]
    Initializing,
    /// Derived and being provisioned
    Provisioning,
    /// Every pipeline phase reported success
    Running,
    /// The last pipeline run failed
    Failed,
}

/// Status for a Cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Lifecycle phase
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Kubernetes version being provisioned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Derived or declared service CIDR
    #[serde(rename = "serviceCIDR", default, skip_serializing_if = "Option::is_none")]
    pub service_cidr: Option<String>,

    /// Prefix length of each node's pod CIDR
    #[serde(rename = "nodeCIDRMaskSize", default, skip_serializing_if = "Option::is_none")]
    pub node_cidr_mask_size: Option<u8>,

    /// Cluster DNS service address
    #[serde(rename = "dnsIP", default, skip_serializing_if = "Option::is_none")]
    pub dns_ip: Option<String>,

    /// Known API server addresses
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<ClusterAddress>,

    /// Per-step condition history
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ClusterStatus {
    /// True once State Derivation has committed its facts
    pub fn is_derived(&self) -> bool {
        self.version.is_some()
            && self.service_cidr.is_some()
            && self.node_cidr_mask_size.is_some()
            && self.dns_ip.is_some()
    }
}
