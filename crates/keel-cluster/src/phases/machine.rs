//! Machine phase pipeline
//!
//! Remote steps open a fresh handle through the connector and run shell
//! commands on the host. Mark-node and node-ready use the target cluster's
//! node API and are no-ops while that cluster is not reachable.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use k8s_openapi::api::core::v1::Node;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use keel_common::conditions::step_report;
use keel_common::crd::{Condition, HookType, Machine, MachinePhase, NODE_CNI_HOOK};
use keel_common::kube_utils::{is_node_ready, poll_until};
use keel_common::{ClusterRecord, Error, ProviderConfig};

use super::{record_outcome, run_step, skippable, SharedRng};
use crate::endpoint::{join_endpoint, master_endpoint};
use crate::installer::{
    ChecklistPreflight, ComponentInstaller, JoinProcedure, KubeadmJoin, NetworkConfigurator,
    PreflightChecks, SystemInstaller,
};
use crate::kubeconfig;
use crate::registry::{ClusterRegistry, TargetCluster};
use crate::remote::{run_checked, shell_quote, RemoteConnector, RemoteExec};

/// File the node kubeconfig is written to, relative to the kubernetes dir
pub const BOOTSTRAP_KUBECONFIG: &str = "bootstrap-kubelet.conf";

/// Hosts file registry entries are written to
const HOSTS_FILE: &str = "/etc/hosts";

/// Steps of the machine pipeline
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MachineStep {
    /// Stage declared files
    CopyFiles,
    /// Pre-install hook
    PreInstallHook,
    /// Host preflight checks
    Preflight,
    /// Registry hosts entries
    RegistryHosts,
    /// Remove previously installed state
    Clean,
    /// System prerequisites
    System,
    /// Kubernetes components
    K8sComponent,
    /// Node kubeconfig
    Kubeconfig,
    /// Join the cluster
    JoinNode,
    /// Node interface configuration
    Eth,
    /// Node CNI configuration
    Cni,
    /// Labels and taints
    MarkNode,
    /// Wait for the node to report Ready
    NodeReady,
    /// Post-install hook
    PostInstallHook,
}

impl MachineStep {
    /// Install steps in run order
    pub const INSTALL: [MachineStep; 13] = [
        Self::CopyFiles,
        Self::PreInstallHook,
        Self::Preflight,
        Self::RegistryHosts,
        Self::System,
        Self::K8sComponent,
        Self::Kubeconfig,
        Self::JoinNode,
        Self::Eth,
        Self::Cni,
        Self::MarkNode,
        Self::NodeReady,
        Self::PostInstallHook,
    ];

    /// Condition type recorded for the step
    pub fn name(&self) -> &'static str {
        match self {
            Self::CopyFiles => "EnsureCopyFiles",
            Self::PreInstallHook => "EnsurePreInstallHook",
            Self::Preflight => "EnsurePreflight",
            Self::RegistryHosts => "EnsureRegistryHosts",
            Self::Clean => "EnsureClean",
            Self::System => "EnsureSystem",
            Self::K8sComponent => "EnsureK8sComponent",
            Self::Kubeconfig => "EnsureKubeconfig",
            Self::JoinNode => "EnsureJoinNode",
            Self::Eth => "EnsureEth",
            Self::Cni => "EnsureCni",
            Self::MarkNode => "EnsureMarkNode",
            Self::NodeReady => "EnsureNodeReady",
            Self::PostInstallHook => "EnsurePostInstallHook",
        }
    }

    /// Install steps that apply to machines of this cluster
    ///
    /// Interface and CNI configuration only run for the node CNI hook.
    pub fn pipeline(record: &ClusterRecord) -> Vec<MachineStep> {
        let node_cni = uses_node_cni(record);
        Self::INSTALL
            .into_iter()
            .filter(|s| node_cni || !matches!(s, Self::Eth | Self::Cni))
            .collect()
    }

    /// Reinstall sequence: clean first, then every install step
    pub fn reinstall(record: &ClusterRecord) -> Vec<MachineStep> {
        let mut steps = vec![Self::Clean];
        steps.extend(Self::pipeline(record));
        steps
    }

    /// Recorded outcome of every install step, `Unknown` when not run yet
    pub fn report(record: &ClusterRecord, machine: &Machine) -> Vec<Condition> {
        let names: Vec<&str> = Self::pipeline(record).iter().map(|s| s.name()).collect();
        let conditions = machine
            .status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or(&[]);
        step_report(&names, conditions)
    }
}

impl std::fmt::Display for MachineStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn uses_node_cni(record: &ClusterRecord) -> bool {
    record.spec().features.hook(HookType::CniInstall) == Some(NODE_CNI_HOOK)
}

/// Labels and taints merged onto a node; `None` when nothing changes
fn marked(node: &Node, machine: &Machine) -> Option<Node> {
    let info = &machine.spec.machine;
    let mut node = node.clone();
    let mut changed = false;

    let labels = node.metadata.labels.get_or_insert_with(Default::default);
    for (k, v) in &info.labels {
        if labels.get(k) != Some(v) {
            labels.insert(k.clone(), v.clone());
            changed = true;
        }
    }

    let spec = node.spec.get_or_insert_with(Default::default);
    let taints = spec.taints.get_or_insert_with(Vec::new);
    for want in &info.taints {
        match taints
            .iter_mut()
            .find(|t| t.key == want.key && t.effect == want.effect)
        {
            Some(have) if have.value == want.value => {}
            Some(have) => {
                *have = want.clone();
                changed = true;
            }
            None => {
                taints.push(want.clone());
                changed = true;
            }
        }
    }

    changed.then_some(node)
}

/// Everything the machine pipeline needs besides the machine and its cluster
pub struct MachineContext {
    /// Provider configuration
    pub config: Arc<ProviderConfig>,
    /// Target cluster lookup for node operations
    pub registry: Arc<dyn ClusterRegistry>,
    /// Opens remote handles to machines
    pub connector: Arc<dyn RemoteConnector>,
    /// System prerequisite installer
    pub system: Arc<dyn SystemInstaller>,
    /// Kubernetes component installer
    pub components: Arc<dyn ComponentInstaller>,
    /// Join procedure
    pub join: Arc<dyn JoinProcedure>,
    /// Preflight checklist
    pub preflight: Arc<dyn PreflightChecks>,
    /// Interface and CNI configuration for the node CNI hook
    pub network: Option<Arc<dyn NetworkConfigurator>>,
    /// Caller's cancellation signal
    pub cancel: CancellationToken,
    /// Skip steps whose last recorded outcome was success
    pub skip_succeeded: bool,
    rng: SharedRng,
}

impl MachineContext {
    /// Start building a context
    pub fn builder(
        config: Arc<ProviderConfig>,
        registry: Arc<dyn ClusterRegistry>,
        connector: Arc<dyn RemoteConnector>,
        system: Arc<dyn SystemInstaller>,
        components: Arc<dyn ComponentInstaller>,
    ) -> MachineContextBuilder {
        MachineContextBuilder {
            config,
            registry,
            connector,
            system,
            components,
            join: None,
            preflight: None,
            network: None,
            cancel: None,
            skip_succeeded: false,
            seed: None,
        }
    }

    /// Install the machine and join it to the cluster
    pub async fn run(&self, machine: &mut Machine, record: &ClusterRecord) -> Result<(), Error> {
        self.run_steps(&MachineStep::pipeline(record), machine, record, false, self.skip_succeeded)
            .await
    }

    /// Clean the machine's installed state, then install and rejoin it
    ///
    /// Recorded conditions are ignored; every step runs.
    pub async fn reinstall(&self, machine: &mut Machine, record: &ClusterRecord) -> Result<(), Error> {
        self.run_steps(&MachineStep::reinstall(record), machine, record, true, false)
            .await
    }

    async fn run_steps(
        &self,
        steps: &[MachineStep],
        machine: &mut Machine,
        record: &ClusterRecord,
        rejoin: bool,
        skip_succeeded: bool,
    ) -> Result<(), Error> {
        let host = machine.spec.machine.ip.clone();
        for step in steps {
            let status = machine.status.get_or_insert_with(Default::default);
            if skippable(skip_succeeded, &status.conditions, step.name()) {
                continue;
            }
            let result = run_step(
                &self.cancel,
                step.name(),
                &host,
                self.run_one(*step, machine, record, rejoin),
            )
            .await;

            let status = machine.status.get_or_insert_with(Default::default);
            if let Err(e) = record_outcome(&mut status.conditions, step.name(), &host, result) {
                status.phase = MachinePhase::Failed;
                return Err(e);
            }
            match step {
                MachineStep::JoinNode => status.phase = MachinePhase::Joined,
                MachineStep::NodeReady => status.phase = MachinePhase::Ready,
                _ => {}
            }
        }
        info!(host = %host, cluster = %record.name(), "machine pipeline complete");
        Ok(())
    }

    /// Run a single step without condition bookkeeping
    pub async fn run_one(
        &self,
        step: MachineStep,
        machine: &Machine,
        record: &ClusterRecord,
        rejoin: bool,
    ) -> Result<(), Error> {
        match step {
            MachineStep::CopyFiles => self.copy_files(machine, record).await,
            MachineStep::PreInstallHook => self.hook(machine, record, HookType::PreInstall).await,
            MachineStep::Preflight => {
                let remote = self.connect(machine).await?;
                self.preflight.run_checks(remote.as_ref()).await
            }
            MachineStep::RegistryHosts => self.registry_hosts(machine).await,
            MachineStep::Clean => self.clean(machine).await,
            MachineStep::System => {
                let remote = self.connect(machine).await?;
                self.system.install(remote.as_ref(), record).await
            }
            MachineStep::K8sComponent => {
                let remote = self.connect(machine).await?;
                self.components.install(remote.as_ref(), record).await
            }
            MachineStep::Kubeconfig => self.node_kubeconfig(machine, record).await,
            MachineStep::JoinNode => self.join_node(machine, record, rejoin).await,
            MachineStep::Eth => {
                let network = self.network(record)?;
                let remote = self.connect(machine).await?;
                network.apply_eth(remote.as_ref(), record).await
            }
            MachineStep::Cni => {
                let network = self.network(record)?;
                let remote = self.connect(machine).await?;
                network.apply_cni(remote.as_ref(), record).await
            }
            MachineStep::MarkNode => self.mark_node(machine, record).await,
            MachineStep::NodeReady => self.node_ready(machine, record).await,
            MachineStep::PostInstallHook => {
                self.hook(machine, record, HookType::PostInstall).await
            }
        }
    }

    async fn connect(&self, machine: &Machine) -> Result<Arc<dyn RemoteExec>, Error> {
        let ssh = machine.spec.ssh()?;
        self.connector.connect(&ssh).await
    }

    fn network(&self, record: &ClusterRecord) -> Result<&dyn NetworkConfigurator, Error> {
        self.network.as_deref().ok_or_else(|| {
            Error::configuration_for(
                record.name(),
                format!("{} hook configured without a network configurator", NODE_CNI_HOOK),
            )
        })
    }

    async fn copy_files(&self, machine: &Machine, record: &ClusterRecord) -> Result<(), Error> {
        let files = &record.spec().features.files;
        if files.is_empty() {
            return Ok(());
        }
        let remote = self.connect(machine).await?;
        for file in files {
            remote.copy_file(&file.src, &file.dst).await?;
            debug!(host = %remote.host_ip(), dst = %file.dst, "copied file");
        }
        Ok(())
    }

    async fn hook(&self, machine: &Machine, record: &ClusterRecord, hook: HookType) -> Result<(), Error> {
        let Some(command) = record.spec().features.hook(hook) else {
            return Ok(());
        };
        let remote = self.connect(machine).await?;
        let host = remote.host_ip();

        if let Some(script) = command.split_whitespace().next() {
            let chmod = format!("chmod +x {}", shell_quote(script));
            match remote.exec(&chmod).await {
                Ok(out) if out.success() => {}
                Ok(out) => warn!(host = %host, stderr = %out.stderr.trim(), "chmod of hook failed"),
                Err(e) => warn!(host = %host, error = %e, "chmod of hook failed"),
            }
        }

        run_checked(remote.as_ref(), command).await?;
        info!(host = %host, hook = ?hook, "hook completed");
        Ok(())
    }

    async fn registry_hosts(&self, machine: &Machine) -> Result<(), Error> {
        if !self.config.need_set_hosts() {
            return Ok(());
        }
        let registry = &self.config.registry;
        let ip = registry.ip.as_deref().unwrap_or_default();

        let mut domains = vec![registry.domain.clone()];
        let tenant = machine.spec.tenant_id.trim();
        if !tenant.is_empty() {
            domains.push(format!("{}.{}", tenant, registry.domain));
        }

        let remote = self.connect(machine).await?;
        for domain in domains {
            let pattern = format!("/[[:space:]]{}$/d", domain.replace('.', "\\."));
            let cmd = format!(
                "sed -i {} {} && echo {} >> {}",
                shell_quote(&pattern),
                HOSTS_FILE,
                shell_quote(&format!("{} {}", ip, domain)),
                HOSTS_FILE,
            );
            run_checked(remote.as_ref(), &cmd).await?;
        }
        Ok(())
    }

    async fn clean(&self, machine: &Machine) -> Result<(), Error> {
        let remote = self.connect(machine).await?;
        let cmd = format!("rm -rf {}", shell_quote(&self.config.kubernetes_dir));
        remote.combined_output(&cmd).await?;
        info!(host = %remote.host_ip(), "cleaned installed state");
        Ok(())
    }

    async fn node_kubeconfig(&self, machine: &Machine, record: &ClusterRecord) -> Result<(), Error> {
        let server = self.rng.with(|rng| master_endpoint(record, rng))?;
        let rendered = kubeconfig::node(record, &server)?;

        let dir = &self.config.kubernetes_dir;
        let path = format!("{}/{}", dir, BOOTSTRAP_KUBECONFIG);
        let cmd = format!(
            "mkdir -p {} && echo {} | base64 -d > {}",
            shell_quote(dir),
            shell_quote(&STANDARD.encode(rendered)),
            shell_quote(&path),
        );

        let remote = self.connect(machine).await?;
        run_checked(remote.as_ref(), &cmd).await?;
        debug!(host = %remote.host_ip(), server = %server, "installed node kubeconfig");
        Ok(())
    }

    async fn join_node(&self, machine: &Machine, record: &ClusterRecord, rejoin: bool) -> Result<(), Error> {
        let address = self.rng.with(|rng| join_endpoint(record, rng))?;
        let endpoint = format!("{}:{}", address.host, address.port);
        let remote = self.connect(machine).await?;
        self.join
            .join(remote.as_ref(), &self.config, record, &endpoint, rejoin)
            .await
    }

    /// Target cluster clients, `None` while the cluster is not reachable
    async fn target(&self, record: &ClusterRecord) -> Result<Option<TargetCluster>, Error> {
        match self.registry.get(&record.name()).await {
            Ok(target) => Ok(Some(target)),
            Err(e) if e.is_not_ready() => {
                debug!(cluster = %record.name(), error = %e, "target cluster not ready");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn mark_node(&self, machine: &Machine, record: &ClusterRecord) -> Result<(), Error> {
        let Some(target) = self.target(record).await? else {
            return Ok(());
        };
        let name = &machine.spec.machine.ip;
        let node = target.nodes.get_node(name).await?.ok_or_else(|| {
            Error::internal_with_context("mark_node", format!("node {} is not registered", name))
        })?;

        match marked(&node, machine) {
            Some(updated) => {
                target.nodes.replace_node(&updated).await?;
                info!(node = %name, "applied labels and taints");
            }
            None => debug!(node = %name, "labels and taints already applied"),
        }
        Ok(())
    }

    async fn node_ready(&self, machine: &Machine, record: &ClusterRecord) -> Result<(), Error> {
        let Some(target) = self.target(record).await? else {
            return Ok(());
        };
        let name = machine.spec.machine.ip.clone();
        let nodes = target.nodes.clone();

        poll_until(
            self.config.node_ready_timeout(),
            self.config.node_ready_interval(),
            &self.cancel,
            "node_ready",
            || {
                let nodes = nodes.clone();
                let name = name.clone();
                async move {
                    Ok(nodes
                        .get_node(&name)
                        .await?
                        .map(|n| is_node_ready(&n))
                        .unwrap_or(false))
                }
            },
        )
        .await?;
        info!(node = %name, "node is ready");
        Ok(())
    }
}

/// Builder for [`MachineContext`]
pub struct MachineContextBuilder {
    config: Arc<ProviderConfig>,
    registry: Arc<dyn ClusterRegistry>,
    connector: Arc<dyn RemoteConnector>,
    system: Arc<dyn SystemInstaller>,
    components: Arc<dyn ComponentInstaller>,
    join: Option<Arc<dyn JoinProcedure>>,
    preflight: Option<Arc<dyn PreflightChecks>>,
    network: Option<Arc<dyn NetworkConfigurator>>,
    cancel: Option<CancellationToken>,
    skip_succeeded: bool,
    seed: Option<u64>,
}

impl MachineContextBuilder {
    /// Override the join procedure (default `kubeadm join`)
    pub fn join(mut self, join: Arc<dyn JoinProcedure>) -> Self {
        self.join = Some(join);
        self
    }

    /// Override the preflight checklist
    pub fn preflight(mut self, preflight: Arc<dyn PreflightChecks>) -> Self {
        self.preflight = Some(preflight);
        self
    }

    /// Interface and CNI configurator for the node CNI hook
    pub fn network(mut self, network: Arc<dyn NetworkConfigurator>) -> Self {
        self.network = Some(network);
        self
    }

    /// Cancellation signal from the caller
    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Skip steps already recorded as successful
    pub fn skip_succeeded(mut self, skip: bool) -> Self {
        self.skip_succeeded = skip;
        self
    }

    /// Fix the endpoint selection sequence (primarily for testing)
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Build the context
    pub fn build(self) -> MachineContext {
        MachineContext {
            config: self.config,
            registry: self.registry,
            connector: self.connector,
            system: self.system,
            components: self.components,
            join: self.join.unwrap_or_else(|| Arc::new(KubeadmJoin)),
            preflight: self
                .preflight
                .unwrap_or_else(|| Arc::new(ChecklistPreflight::default())),
            network: self.network,
            cancel: self.cancel.unwrap_or_default(),
            skip_succeeded: self.skip_succeeded,
            rng: self
                .seed
                .map(SharedRng::seeded)
                .unwrap_or_else(SharedRng::from_entropy),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus, Taint};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use keel_common::crd::{ConditionStatus, MachineInfo, MachineSpec};
    use keel_common::crd::{Cluster, ClusterProperties, ClusterSpec};

    use super::*;
    use crate::derive::derive_cluster_state;
    use crate::ids::SecureIdGenerator;
    use crate::pki::ensure_certificates;
    use crate::registry::StaticRegistry;
    use crate::remote::{ExecOutput, MockRemoteConnector};
    use crate::store::MemoryStore;

    const IP: &str = "192.168.1.10";

    /// Records every command and fails those starting with `fail_prefix`
    struct ScriptedRemote {
        fail_prefix: Option<String>,
        log: Mutex<Vec<String>>,
    }

    impl ScriptedRemote {
        fn new(fail_prefix: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                fail_prefix: fail_prefix.map(String::from),
                log: Mutex::new(Vec::new()),
            })
        }

        fn commands(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RemoteExec for ScriptedRemote {
        fn host_ip(&self) -> String {
            IP.to_string()
        }

        async fn exec(&self, cmd: &str) -> Result<ExecOutput, Error> {
            self.log.lock().unwrap().push(cmd.to_string());
            let failed = self
                .fail_prefix
                .as_deref()
                .is_some_and(|p| cmd.starts_with(p));
            Ok(ExecOutput {
                exit_code: if failed { 2 } else { 0 },
                stderr: if failed { "boom".to_string() } else { String::new() },
                ..Default::default()
            })
        }

        async fn combined_output(&self, cmd: &str) -> Result<String, Error> {
            self.log.lock().unwrap().push(cmd.to_string());
            Ok(String::new())
        }

        async fn copy_file(&self, src: &str, dst: &str) -> Result<(), Error> {
            self.log.lock().unwrap().push(format!("copy {} {}", src, dst));
            Ok(())
        }
    }

    /// Stands in for every external installer and records what ran
    #[derive(Default)]
    struct FakeInstaller {
        calls: Mutex<Vec<String>>,
    }

    impl FakeInstaller {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn push(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }
    }

    #[async_trait]
    impl SystemInstaller for FakeInstaller {
        async fn install(&self, _: &dyn RemoteExec, _: &ClusterRecord) -> Result<(), Error> {
            self.push("system");
            Ok(())
        }
    }

    #[async_trait]
    impl ComponentInstaller for FakeInstaller {
        async fn install(&self, _: &dyn RemoteExec, _: &ClusterRecord) -> Result<(), Error> {
            self.push("components");
            Ok(())
        }
    }

    #[async_trait]
    impl PreflightChecks for FakeInstaller {
        async fn run_checks(&self, _: &dyn RemoteExec) -> Result<(), Error> {
            self.push("preflight");
            Ok(())
        }
    }

    #[async_trait]
    impl JoinProcedure for FakeInstaller {
        async fn join(
            &self,
            _: &dyn RemoteExec,
            _: &ProviderConfig,
            _: &ClusterRecord,
            endpoint: &str,
            rejoin: bool,
        ) -> Result<(), Error> {
            self.push(format!("join {} rejoin={}", endpoint, rejoin));
            Ok(())
        }
    }

    fn record() -> ClusterRecord {
        let mut record = ClusterRecord::new(Cluster::new(
            "c1",
            ClusterSpec {
                version: "1.32.0".to_string(),
                cluster_cidr: "10.0.0.0/16".to_string(),
                service_cidr: None,
                dns_domain: "cluster.local".to_string(),
                properties: ClusterProperties {
                    max_node_pod_num: 64,
                    max_cluster_service_num: 4096,
                },
                machines: vec![MachineInfo {
                    ip: IP.to_string(),
                    ..Default::default()
                }],
                features: Default::default(),
                public_alternative_names: Vec::new(),
                tenant_id: None,
            },
        ));
        derive_cluster_state(&mut record, &SecureIdGenerator).unwrap();
        ensure_certificates(&mut record, false).unwrap();
        record
    }

    fn machine(tenant: &str) -> Machine {
        let mut labels = BTreeMap::new();
        labels.insert("keel.io/pool".to_string(), "edge".to_string());
        Machine::new(
            "m1",
            MachineSpec {
                cluster_name: "c1".to_string(),
                tenant_id: tenant.to_string(),
                machine: MachineInfo {
                    ip: IP.to_string(),
                    password: Some("pw".to_string()),
                    labels,
                    taints: vec![Taint {
                        key: "dedicated".to_string(),
                        value: Some("edge".to_string()),
                        effect: "NoSchedule".to_string(),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
            },
        )
    }

    fn node(ready: bool) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(IP.to_string()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn connector(remote: Arc<ScriptedRemote>) -> Arc<MockRemoteConnector> {
        let mut connector = MockRemoteConnector::new();
        connector.expect_connect().returning(move |ssh| {
            assert_eq!(ssh.host, IP);
            Ok(remote.clone() as Arc<dyn RemoteExec>)
        });
        Arc::new(connector)
    }

    fn context(
        config: ProviderConfig,
        registry: Arc<StaticRegistry>,
        connector: Arc<dyn RemoteConnector>,
        fake: Arc<FakeInstaller>,
    ) -> MachineContext {
        MachineContext::builder(
            Arc::new(config),
            registry,
            connector,
            fake.clone(),
            fake.clone(),
        )
        .join(fake.clone())
        .preflight(fake)
        .seed(1)
        .build()
    }

    fn target_with(node: Node) -> (Arc<StaticRegistry>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.insert_node(node);
        let registry = Arc::new(StaticRegistry::new());
        registry.insert(TargetCluster {
            name: "c1".to_string(),
            store: store.clone(),
            nodes: store.clone(),
        });
        (registry, store)
    }

    #[tokio::test]
    async fn install_joins_marks_and_waits_for_node() {
        let remote = ScriptedRemote::new(None);
        let fake = Arc::new(FakeInstaller::default());
        let (registry, store) = target_with(node(true));
        let ctx = context(
            ProviderConfig::default(),
            registry,
            connector(remote.clone()),
            fake.clone(),
        );
        let record = record();
        let mut machine = machine("");

        ctx.run(&mut machine, &record).await.unwrap();

        let status = machine.status.as_ref().unwrap();
        assert_eq!(status.phase, MachinePhase::Ready);
        assert_eq!(
            fake.calls(),
            vec!["preflight", "system", "components", "join 192.168.1.10:6443 rejoin=false"]
        );
        assert!(remote
            .commands()
            .iter()
            .any(|c| c.contains("/etc/kubernetes/bootstrap-kubelet.conf")));

        let marked = store.node(IP).unwrap();
        assert_eq!(
            marked.metadata.labels.unwrap().get("keel.io/pool").map(String::as_str),
            Some("edge")
        );
        assert_eq!(marked.spec.unwrap().taints.unwrap().len(), 1);

        let report = MachineStep::report(&record, &machine);
        assert_eq!(report.len(), 11);
        assert!(report.iter().all(|c| c.status == ConditionStatus::Success));
    }

    #[tokio::test]
    async fn failing_hook_stops_the_pipeline() {
        let remote = ScriptedRemote::new(Some("/opt/keel/pre.sh"));
        let fake = Arc::new(FakeInstaller::default());
        let ctx = context(
            ProviderConfig::default(),
            Arc::new(StaticRegistry::new()),
            connector(remote.clone()),
            fake.clone(),
        );
        let mut record = record();
        record
            .cluster
            .spec
            .features
            .hooks
            .insert(HookType::PreInstall, "/opt/keel/pre.sh --fast".to_string());
        let mut machine = machine("");

        let err = ctx.run(&mut machine, &record).await.unwrap_err();

        assert!(matches!(err, Error::Phase { .. }));
        assert!(matches!(err.root(), Error::RemoteCommand { exit_code: 2, .. }));
        assert_eq!(remote.commands()[0], "chmod +x '/opt/keel/pre.sh'");
        assert!(fake.calls().is_empty());

        let status = machine.status.as_ref().unwrap();
        assert_eq!(status.phase, MachinePhase::Failed);
        let report = MachineStep::report(&record, &machine);
        assert_eq!(report[1].type_, "EnsurePreInstallHook");
        assert_eq!(report[1].status, ConditionStatus::Failure);
        assert_eq!(report[2].status, ConditionStatus::Unknown);
    }

    #[tokio::test]
    async fn registry_hosts_cover_tenant_domain() {
        let remote = ScriptedRemote::new(None);
        let mut config = ProviderConfig::default();
        config.registry.domain = "registry.keel.local".to_string();
        config.registry.ip = Some("10.10.0.5".to_string());
        let ctx = context(
            config,
            Arc::new(StaticRegistry::new()),
            connector(remote.clone()),
            Arc::new(FakeInstaller::default()),
        );

        ctx.run_one(MachineStep::RegistryHosts, &machine("t1"), &record(), false)
            .await
            .unwrap();

        let commands = remote.commands();
        assert_eq!(commands.len(), 2);
        assert!(commands[0].contains(r"registry\.keel\.local$"));
        assert!(commands[0].ends_with("echo '10.10.0.5 registry.keel.local' >> /etc/hosts"));
        assert!(commands[1].contains("'10.10.0.5 t1.registry.keel.local'"));
    }

    #[tokio::test]
    async fn registry_hosts_skipped_without_registry_ip() {
        let mut connector = MockRemoteConnector::new();
        connector.expect_connect().never();
        let ctx = context(
            ProviderConfig::default(),
            Arc::new(StaticRegistry::new()),
            Arc::new(connector),
            Arc::new(FakeInstaller::default()),
        );
        ctx.run_one(MachineStep::RegistryHosts, &machine("t1"), &record(), false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn node_steps_wait_for_reachable_cluster() {
        let mut connector = MockRemoteConnector::new();
        connector.expect_connect().never();
        let ctx = context(
            ProviderConfig::default(),
            Arc::new(StaticRegistry::new()),
            Arc::new(connector),
            Arc::new(FakeInstaller::default()),
        );
        let record = record();
        let machine = machine("");

        ctx.run_one(MachineStep::MarkNode, &machine, &record, false)
            .await
            .unwrap();
        ctx.run_one(MachineStep::NodeReady, &machine, &record, false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn marking_twice_updates_once() {
        let (registry, store) = target_with(node(true));
        let ctx = context(
            ProviderConfig::default(),
            registry,
            Arc::new(MockRemoteConnector::new()),
            Arc::new(FakeInstaller::default()),
        );
        let record = record();
        let machine = machine("");

        for _ in 0..2 {
            ctx.run_one(MachineStep::MarkNode, &machine, &record, false)
                .await
                .unwrap();
        }
        assert_eq!(store.mutations().node_updates, 1);
    }

    #[tokio::test]
    async fn unregistered_node_cannot_be_marked() {
        let registry = Arc::new(StaticRegistry::new());
        let store = Arc::new(MemoryStore::new());
        registry.insert(TargetCluster {
            name: "c1".to_string(),
            store: store.clone(),
            nodes: store,
        });
        let ctx = context(
            ProviderConfig::default(),
            registry,
            Arc::new(MockRemoteConnector::new()),
            Arc::new(FakeInstaller::default()),
        );

        let err = ctx
            .run_one(MachineStep::MarkNode, &machine(""), &record(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal { .. }));
    }

    #[tokio::test]
    async fn node_ready_times_out() {
        tokio::time::pause();
        let (registry, _store) = target_with(node(false));
        let ctx = context(
            ProviderConfig::default(),
            registry,
            Arc::new(MockRemoteConnector::new()),
            Arc::new(FakeInstaller::default()),
        );

        let err = ctx
            .run_one(MachineStep::NodeReady, &machine(""), &record(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn reinstall_cleans_then_rejoins() {
        let remote = ScriptedRemote::new(None);
        let fake = Arc::new(FakeInstaller::default());
        let (registry, _store) = target_with(node(true));
        let ctx = context(
            ProviderConfig::default(),
            registry,
            connector(remote.clone()),
            fake.clone(),
        );
        let record = record();
        let mut machine = machine("");

        ctx.reinstall(&mut machine, &record).await.unwrap();

        assert_eq!(remote.commands()[0], "rm -rf '/etc/kubernetes'");
        assert!(fake
            .calls()
            .contains(&"join 192.168.1.10:6443 rejoin=true".to_string()));
        assert_eq!(machine.status.unwrap().phase, MachinePhase::Ready);
    }

    #[tokio::test]
    async fn node_cni_requires_a_configurator() {
        let remote = ScriptedRemote::new(None);
        let ctx = context(
            ProviderConfig::default(),
            Arc::new(StaticRegistry::new()),
            connector(remote),
            Arc::new(FakeInstaller::default()),
        );
        let mut record = record();
        record
            .cluster
            .spec
            .features
            .hooks
            .insert(HookType::CniInstall, NODE_CNI_HOOK.to_string());

        let steps = MachineStep::pipeline(&record);
        assert!(steps.contains(&MachineStep::Eth));
        assert!(steps.contains(&MachineStep::Cni));

        let err = ctx
            .run_one(MachineStep::Eth, &machine(""), &record, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn pipeline_without_node_cni_skips_network_steps() {
        let steps = MachineStep::pipeline(&record());
        assert_eq!(steps.len(), 11);
        assert_eq!(steps[0], MachineStep::CopyFiles);
        assert_eq!(steps[10], MachineStep::PostInstallHook);
        assert_eq!(MachineStep::reinstall(&record())[0], MachineStep::Clean);
    }
}
