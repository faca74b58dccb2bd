//! Machine Custom Resource Definition
//!
//! A Machine is one host joined to exactly one Cluster over SSH.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, MachineInfo, SshSpec};
use crate::Error;

/// Specification for a Machine
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "devops.keel.io",
    version = "v1",
    kind = "Machine",
    plural = "machines",
    status = "MachineStatus",
    namespaced,
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.clusterName"}"#,
    printcolumn = r#"{"name":"IP","type":"string","jsonPath":".spec.machine.ip"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Cluster this machine belongs to
    pub cluster_name: String,

    /// Tenant owning the machine, used for the tenant-scoped registry domain
    #[serde(default)]
    pub tenant_id: String,

    /// Host and access details
    pub machine: MachineInfo,
}

impl MachineSpec {
    /// Build the remote-access descriptor for this machine
    pub fn ssh(&self) -> Result<SshSpec, Error> {
        let info = &self.machine;
        if info.ip.is_empty() {
            return Err(Error::configuration_for_field(
                &self.cluster_name,
                "spec.machine.ip",
                "machine has no IP",
            ));
        }
        if info.password.is_none() && info.private_key.is_none() {
            return Err(Error::configuration_for_field(
                &self.cluster_name,
                "spec.machine",
                format!("machine {} has neither password nor private key", info.ip),
            ));
        }
        Ok(SshSpec {
            host: info.ip.clone(),
            port: info.port,
            user: info.username.clone(),
            password: info.password.clone(),
            private_key: info.private_key.clone(),
        })
    }
}

/// Lifecycle phase of a machine
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MachinePhase {
    /// Declared only
    #[default]
    Declared,
    /// Join completed
    Joined,
    /// Node reported Ready
    Ready,
    /// The last pipeline run failed
    Failed,
}

/// Status for a Machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Lifecycle phase
    #[serde(default)]
    pub phase: MachinePhase,

    /// Per-step condition history
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(password: Option<&str>, key: Option<&str>) -> MachineSpec {
        MachineSpec {
            cluster_name: "c1".to_string(),
            tenant_id: "t1".to_string(),
            machine: MachineInfo {
                ip: "10.0.0.7".to_string(),
                port: 2222,
                username: "ops".to_string(),
                password: password.map(String::from),
                private_key: key.map(String::from),
                ..Default::default()
            },
        }
    }

    #[test]
    fn ssh_descriptor_from_password() {
        let ssh = spec(Some("pw"), None).ssh().expect("password auth is valid");
        assert_eq!(ssh.host, "10.0.0.7");
        assert_eq!(ssh.port, 2222);
        assert_eq!(ssh.user, "ops");
    }

    #[test]
    fn ssh_descriptor_requires_a_credential() {
        let err = spec(None, None).ssh().unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }
}
