//! Supporting types for the Cluster and Machine CRDs

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Taint;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Kind of cluster address
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum AddressType {
    /// Direct machine IP
    Real,
    /// Virtual/HA IP or third-party load balanced endpoint
    Advertise,
}

impl std::fmt::Display for AddressType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Real => write!(f, "Real"),
            Self::Advertise => write!(f, "Advertise"),
        }
    }
}

/// An address the cluster's API server is reachable on
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ClusterAddress {
    /// Address kind
    #[serde(rename = "type")]
    pub type_: AddressType,
    /// Host or IP
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl ClusterAddress {
    /// Create a new address
    pub fn new(type_: AddressType, host: impl Into<String>, port: u16) -> Self {
        Self {
            type_,
            host: host.into(),
            port,
        }
    }

    /// Render as an https URL
    pub fn url(&self) -> String {
        format!("https://{}:{}", self.host, self.port)
    }
}

/// Capacity properties used to size cluster networking
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterProperties {
    /// Maximum pods scheduled on a single node
    pub max_node_pod_num: u32,
    /// Maximum services in the cluster
    pub max_cluster_service_num: u32,
}

impl Default for ClusterProperties {
    fn default() -> Self {
        Self {
            max_node_pod_num: 256,
            max_cluster_service_num: 256,
        }
    }
}

/// Self-managed VIP (keepalived style) in front of the control plane
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct SelfManagedHa {
    /// Virtual IP
    pub vip: String,
}

/// VIP served by an external load balancer
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ThirdPartyHa {
    /// Virtual IP
    pub vip: String,
    /// Port the load balancer listens on
    pub vport: u16,
}

/// High availability configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HaSpec {
    /// Self-managed VIP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_managed: Option<SelfManagedHa>,
    /// Third-party VIP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub third_party: Option<ThirdPartyHa>,
}

/// Hook points a cluster can configure
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum HookType {
    /// Command run on each machine before installation
    PreInstall,
    /// Command run on each machine after it is ready
    PostInstall,
    /// CNI flavour requiring per-node interface configuration
    CniInstall,
}

/// CNI hook value that enables per-node interface and CNI configuration
pub const NODE_CNI_HOOK: &str = "dke-cni";

/// A file staged onto every machine before installation
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct FileSpec {
    /// Local source path
    pub src: String,
    /// Destination path on the machine
    pub dst: String,
}

/// Optional cluster features
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ClusterFeatures {
    /// HA configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ha: Option<HaSpec>,
    /// Hook commands keyed by hook point
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hooks: BTreeMap<HookType, String>,
    /// Files copied to each machine
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileSpec>,
}

impl ClusterFeatures {
    /// Third-party HA configuration, if any
    pub fn third_party_ha(&self) -> Option<&ThirdPartyHa> {
        self.ha.as_ref().and_then(|ha| ha.third_party.as_ref())
    }

    /// Hook command for a hook point, treating blank commands as absent
    pub fn hook(&self, hook: HookType) -> Option<&str> {
        self.hooks
            .get(&hook)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }
}

/// A machine as declared in a cluster or machine spec
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineInfo {
    /// Machine IP, also the node name once joined
    pub ip: String,
    /// SSH port
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// SSH user
    #[serde(default = "default_ssh_user")]
    pub username: String,
    /// SSH password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// PEM encoded SSH private key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    /// Labels applied to the node
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Taints applied to the node
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_user() -> String {
    "root".to_string()
}

/// Remote-access descriptor for a machine
#[derive(Clone, PartialEq, Eq)]
pub struct SshSpec {
    /// Host IP
    pub host: String,
    /// SSH port
    pub port: u16,
    /// SSH user
    pub user: String,
    /// Password, when password auth is used
    pub password: Option<String>,
    /// Private key, when key auth is used
    pub private_key: Option<String>,
}

impl std::fmt::Debug for SshSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Don't expose credentials in debug output
        f.debug_struct("SshSpec")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .finish()
    }
}

/// Condition status of a provisioning step
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Step completed
    Success,
    /// Step failed
    Failure,
    /// Step has not reported yet
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "Success"),
            Self::Failure => write!(f, "Failure"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Timestamped outcome of one provisioning step
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Step name (e.g., EnsureCerts)
    #[serde(rename = "type")]
    pub type_: String,

    /// Outcome of the step
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}
