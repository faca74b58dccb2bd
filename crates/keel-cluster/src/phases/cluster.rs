//! Cluster phase pipeline
//!
//! Runs against the management cluster's store, except the addon steps
//! which run against the target cluster once it is reachable.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use keel_common::conditions::step_report;
use keel_common::crd::{ClusterPhase, Condition};
use keel_common::{ClusterRecord, Error, ProviderConfig, EXTERNAL_ADMIN_KUBECONFIG};

use super::{record_outcome, run_step, skippable};
use crate::addons::{apply_addons, AddonBuilder, AddonSet};
use crate::control_plane::control_plane_objects;
use crate::derive::derive_cluster_state;
use crate::ids::{IdGenerator, SecureIdGenerator};
use crate::kubeconfig;
use crate::pki::ensure_certificates;
use crate::reconcile::ensure_all;
use crate::registry::ClusterRegistry;
use crate::store::ObjectStore;

/// Steps of the cluster pipeline, in run order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterStep {
    /// State derivation, first pass only
    Complete,
    /// Certificate set
    Certs,
    /// Admin kubeconfig
    Kubeconfig,
    /// Hosted control-plane objects
    KubeMaster,
    /// Kubeconfig against the third-party VIP
    ExtKubeconfig,
    /// kube-proxy and DNS
    Addons,
    /// Flannel CNI
    Flannel,
    /// Metrics collector
    MetricsServer,
}

impl ClusterStep {
    /// Every step in run order
    pub const ALL: [ClusterStep; 8] = [
        Self::Complete,
        Self::Certs,
        Self::Kubeconfig,
        Self::KubeMaster,
        Self::ExtKubeconfig,
        Self::Addons,
        Self::Flannel,
        Self::MetricsServer,
    ];

    /// Condition type recorded for the step
    pub fn name(&self) -> &'static str {
        match self {
            Self::Complete => "EnsureClusterComplete",
            Self::Certs => "EnsureCerts",
            Self::Kubeconfig => "EnsureKubeconfig",
            Self::KubeMaster => "EnsureKubeMaster",
            Self::ExtKubeconfig => "EnsureExtKubeconfig",
            Self::Addons => "EnsureAddons",
            Self::Flannel => "EnsureFlannel",
            Self::MetricsServer => "EnsureMetricsServer",
        }
    }

    /// Steps that apply to this cluster
    ///
    /// The external kubeconfig only exists for third-party HA.
    pub fn pipeline(record: &ClusterRecord) -> Vec<ClusterStep> {
        let third_party = record.spec().features.third_party_ha().is_some();
        Self::ALL
            .into_iter()
            .filter(|s| *s != Self::ExtKubeconfig || third_party)
            .collect()
    }

    /// Recorded outcome of every step that applies, `Unknown` when not run yet
    pub fn report(record: &ClusterRecord) -> Vec<Condition> {
        let names: Vec<&str> = Self::pipeline(record).iter().map(|s| s.name()).collect();
        step_report(&names, &record.status().conditions)
    }
}

impl std::fmt::Display for ClusterStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything the cluster pipeline needs besides the record
pub struct ClusterContext {
    /// Provider configuration
    pub config: Arc<ProviderConfig>,
    /// Management cluster store the control plane lives in
    pub store: Arc<dyn ObjectStore>,
    /// Target cluster lookup for addons
    pub registry: Arc<dyn ClusterRegistry>,
    /// Addon builders
    pub addons: AddonSet,
    /// Credential source for derivation
    pub ids: Arc<dyn IdGenerator>,
    /// Caller's cancellation signal
    pub cancel: CancellationToken,
    /// Skip steps whose last recorded outcome was success
    pub skip_succeeded: bool,
}

impl ClusterContext {
    /// Start building a context
    pub fn builder(
        config: Arc<ProviderConfig>,
        store: Arc<dyn ObjectStore>,
        registry: Arc<dyn ClusterRegistry>,
    ) -> ClusterContextBuilder {
        ClusterContextBuilder::new(config, store, registry)
    }

    /// Run every applicable step in order, stopping at the first failure
    pub async fn run(&self, record: &mut ClusterRecord) -> Result<(), Error> {
        let name = record.name();
        for step in ClusterStep::pipeline(record) {
            if skippable(self.skip_succeeded, &record.status().conditions, step.name()) {
                continue;
            }
            let result = run_step(&self.cancel, step.name(), &name, self.run_one(step, record)).await;
            if let Err(e) = record_outcome(
                &mut record.status_mut().conditions,
                step.name(),
                &name,
                result,
            ) {
                record.status_mut().phase = ClusterPhase::Failed;
                return Err(e);
            }
        }
        record.status_mut().phase = ClusterPhase::Running;
        info!(cluster = %name, "cluster pipeline complete");
        Ok(())
    }

    /// Run a single step without condition bookkeeping
    pub async fn run_one(&self, step: ClusterStep, record: &mut ClusterRecord) -> Result<(), Error> {
        match step {
            ClusterStep::Complete => self.ensure_complete(record),
            ClusterStep::Certs => ensure_certificates(record, false).map(|_| ()),
            ClusterStep::Kubeconfig => ensure_kubeconfig(record),
            ClusterStep::KubeMaster => self.ensure_kube_master(record).await,
            ClusterStep::ExtKubeconfig => ensure_ext_kubeconfig(record),
            ClusterStep::Addons => {
                let builders = [self.addons.kube_proxy.as_ref(), self.addons.dns.as_ref()];
                self.ensure_addons(record, &builders).await
            }
            ClusterStep::Flannel => {
                self.ensure_addons(record, &[self.addons.flannel.as_ref()])
                    .await
            }
            ClusterStep::MetricsServer => {
                self.ensure_addons(record, &[self.addons.metrics_server.as_ref()])
                    .await
            }
        }
    }

    fn ensure_complete(&self, record: &mut ClusterRecord) -> Result<(), Error> {
        if record.status().is_derived() && record.credential.has_tokens() {
            debug!(cluster = %record.name(), "cluster state already derived");
            return Ok(());
        }
        derive_cluster_state(record, self.ids.as_ref())
    }

    async fn ensure_kube_master(&self, record: &ClusterRecord) -> Result<(), Error> {
        let objects = control_plane_objects(&self.config, record)?;
        ensure_all(self.store.as_ref(), &objects).await?;
        Ok(())
    }

    async fn ensure_addons(
        &self,
        record: &ClusterRecord,
        builders: &[&dyn AddonBuilder],
    ) -> Result<(), Error> {
        apply_addons(self.registry.as_ref(), &self.config, record, builders).await?;
        Ok(())
    }
}

/// Render the admin kubeconfig against the in-cluster API server
///
/// Kept while it matches the current server, CA and admin certificate.
pub fn ensure_kubeconfig(record: &mut ClusterRecord) -> Result<(), Error> {
    let server = kubeconfig::in_cluster_server(record);
    let rendered = kubeconfig::admin(record, &server)?;
    if record.credential.kubeconfig.as_deref() == Some(rendered.as_str()) {
        debug!(cluster = %record.name(), "admin kubeconfig up to date");
        return Ok(());
    }
    record.credential.kubeconfig = Some(rendered);
    info!(cluster = %record.name(), server = %server, "rendered admin kubeconfig");
    Ok(())
}

/// Export a kubeconfig against the third-party VIP into the credential's
/// extension data
pub fn ensure_ext_kubeconfig(record: &mut ClusterRecord) -> Result<(), Error> {
    let rendered = kubeconfig::external(record)?;
    let existing = record.credential.ext_data.get(EXTERNAL_ADMIN_KUBECONFIG);
    if existing == Some(&rendered) {
        debug!(cluster = %record.name(), "external kubeconfig up to date");
        return Ok(());
    }
    record
        .credential
        .ext_data
        .insert(EXTERNAL_ADMIN_KUBECONFIG.to_string(), rendered);
    info!(cluster = %record.name(), "exported external kubeconfig");
    Ok(())
}

/// Builder for [`ClusterContext`]
pub struct ClusterContextBuilder {
    config: Arc<ProviderConfig>,
    store: Arc<dyn ObjectStore>,
    registry: Arc<dyn ClusterRegistry>,
    addons: Option<AddonSet>,
    ids: Option<Arc<dyn IdGenerator>>,
    cancel: Option<CancellationToken>,
    skip_succeeded: bool,
}

impl ClusterContextBuilder {
    fn new(
        config: Arc<ProviderConfig>,
        store: Arc<dyn ObjectStore>,
        registry: Arc<dyn ClusterRegistry>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            addons: None,
            ids: None,
            cancel: None,
            skip_succeeded: false,
        }
    }

    /// Addon builders (default installs nothing)
    pub fn addons(mut self, addons: AddonSet) -> Self {
        self.addons = Some(addons);
        self
    }

    /// Override the credential source (primarily for testing)
    pub fn ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
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

    /// Build the context
    pub fn build(self) -> ClusterContext {
        ClusterContext {
            config: self.config,
            store: self.store,
            registry: self.registry,
            addons: self.addons.unwrap_or_else(AddonSet::empty),
            ids: self.ids.unwrap_or_else(|| Arc::new(SecureIdGenerator)),
            cancel: self.cancel.unwrap_or_default(),
            skip_succeeded: self.skip_succeeded,
        }
    }
}
