//! Host installer capabilities used by the machine phases
//!
//! System prerequisites, the Kubernetes component set and per-node network
//! configuration are supplied by the caller. Preflight checks and the
//! kubeadm join have default implementations here.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use x509_parser::prelude::*;

use keel_common::{ClusterRecord, Error, ProviderConfig};

use crate::pki::parse_pem;
use crate::remote::{run_checked, shell_quote, RemoteExec};

/// Installs base system prerequisites (container runtime, sysctls, packages)
#[async_trait]
pub trait SystemInstaller: Send + Sync {
    /// Install onto the host behind `remote`
    async fn install(&self, remote: &dyn RemoteExec, record: &ClusterRecord) -> Result<(), Error>;
}

/// Installs the node's Kubernetes components (kubelet, kubeadm, images)
#[async_trait]
pub trait ComponentInstaller: Send + Sync {
    /// Install onto the host behind `remote`
    async fn install(&self, remote: &dyn RemoteExec, record: &ClusterRecord) -> Result<(), Error>;
}

/// Joins a prepared host to the cluster
#[async_trait]
pub trait JoinProcedure: Send + Sync {
    /// Join through `endpoint` (`host:port`); `rejoin` resets prior state first
    async fn join(
        &self,
        remote: &dyn RemoteExec,
        config: &ProviderConfig,
        record: &ClusterRecord,
        endpoint: &str,
        rejoin: bool,
    ) -> Result<(), Error>;
}

/// Host checks run before anything is installed
#[async_trait]
pub trait PreflightChecks: Send + Sync {
    /// Run every check, failing on the first that does not pass
    async fn run_checks(&self, remote: &dyn RemoteExec) -> Result<(), Error>;
}

/// Per-node interface and CNI configuration for the node CNI flavour
#[async_trait]
pub trait NetworkConfigurator: Send + Sync {
    /// Configure the node's network interfaces
    async fn apply_eth(&self, remote: &dyn RemoteExec, record: &ClusterRecord) -> Result<(), Error>;

    /// Write the node's CNI configuration
    async fn apply_cni(&self, remote: &dyn RemoteExec, record: &ClusterRecord) -> Result<(), Error>;
}

/// One preflight check: a shell command that exits 0 when the host passes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreflightCheck {
    /// Short check name for logs
    pub name: String,
    /// Command to run
    pub command: String,
}

impl PreflightCheck {
    /// Create a check
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
        }
    }
}

/// Preflight checks run as shell commands, in order
#[derive(Clone, Debug)]
pub struct ChecklistPreflight {
    checks: Vec<PreflightCheck>,
}

impl ChecklistPreflight {
    /// Use a custom checklist
    pub fn new(checks: Vec<PreflightCheck>) -> Self {
        Self { checks }
    }

    /// Checks in the order they run
    pub fn checks(&self) -> &[PreflightCheck] {
        &self.checks
    }
}

impl Default for ChecklistPreflight {
    fn default() -> Self {
        Self::new(vec![
            PreflightCheck::new("cpu", "test \"$(nproc)\" -ge 2"),
            PreflightCheck::new(
                "memory",
                "test \"$(awk '/MemTotal/ {print $2}' /proc/meminfo)\" -ge 1700000",
            ),
            PreflightCheck::new("swap", "test -z \"$(swapon --noheadings 2>/dev/null)\""),
            PreflightCheck::new(
                "disk",
                "test \"$(df -Pk /var/lib | awk 'NR==2 {print $4}')\" -ge 10485760",
            ),
            PreflightCheck::new("kubelet-port", "! ss -Hltn 'sport = :10250' | grep -q ."),
            PreflightCheck::new(
                "br_netfilter",
                "modprobe br_netfilter && test -d /proc/sys/net/bridge",
            ),
            PreflightCheck::new("ip_forward", "sysctl -w net.ipv4.ip_forward=1"),
        ])
    }
}

#[async_trait]
impl PreflightChecks for ChecklistPreflight {
    async fn run_checks(&self, remote: &dyn RemoteExec) -> Result<(), Error> {
        let host = remote.host_ip();
        for check in &self.checks {
            debug!(host = %host, check = %check.name, "running preflight check");
            run_checked(remote, &check.command).await?;
        }
        info!(host = %host, checks = self.checks.len(), "preflight checks passed");
        Ok(())
    }
}

/// `sha256:<hex>` pin of the CA public key, as `kubeadm join` expects
pub fn ca_cert_hash(ca_cert_pem: &str) -> Result<String, Error> {
    let der = parse_pem(ca_cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| Error::crypto(format!("failed to parse CA certificate: {}", e)))?;
    let digest = Sha256::digest(cert.public_key().raw);
    Ok(format!("sha256:{}", hex::encode(digest)))
}

/// Joins with `kubeadm join` using the cluster's bootstrap token
#[derive(Clone, Copy, Debug, Default)]
pub struct KubeadmJoin;

impl KubeadmJoin {
    /// Command line joining a worker through `endpoint`
    pub fn command(record: &ClusterRecord, endpoint: &str) -> Result<String, Error> {
        let name = record.name();
        let token = record.credential.bootstrap_token.as_deref().ok_or_else(|| {
            Error::configuration_for(&name, "bootstrap token has not been derived")
        })?;
        let ca = record
            .credential
            .ca_cert
            .as_deref()
            .ok_or_else(|| Error::configuration_for(&name, "cluster CA has not been issued"))?;

        Ok(format!(
            "kubeadm join {} --token {} --discovery-token-ca-cert-hash {}",
            shell_quote(endpoint),
            shell_quote(token),
            ca_cert_hash(ca)?,
        ))
    }
}

#[async_trait]
impl JoinProcedure for KubeadmJoin {
    async fn join(
        &self,
        remote: &dyn RemoteExec,
        config: &ProviderConfig,
        record: &ClusterRecord,
        endpoint: &str,
        rejoin: bool,
    ) -> Result<(), Error> {
        let join = Self::command(record, endpoint)?;
        if rejoin {
            run_checked(remote, "kubeadm reset -f").await?;
        } else {
            let kubelet_conf = format!("{}/kubelet.conf", config.kubernetes_dir);
            let joined = format!("test -f {}", shell_quote(&kubelet_conf));
            match remote.exec(&joined).await {
                Ok(output) if output.success() => {
                    debug!(host = %remote.host_ip(), "node already joined");
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(
                        host = %remote.host_ip(),
                        error = %e,
                        "kubelet.conf check failed, joining"
                    );
                }
            }
        }
        run_checked(remote, &join).await?;
        info!(host = %remote.host_ip(), endpoint = %endpoint, "node joined");
        Ok(())
    }
}
