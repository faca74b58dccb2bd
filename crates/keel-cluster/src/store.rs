//! Declarative store capability
//!
//! [`ManagedObject`] is the closed set of object kinds the provisioning
//! phases reconcile. Each kind decides for itself which live fields it
//! controls; see [`ManagedObject::diverges_from`].

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{
    ConfigMap, Node, Secret, Service, ServiceAccount, ServicePort,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, ListParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

#[cfg(test)]
use mockall::automock;

use keel_common::Error;

/// Annotation holding the hash of a workload's desired spec
///
/// The API server defaults many pod template fields, so workloads are
/// compared by this hash rather than field by field.
pub const SPEC_HASH_ANNOTATION: &str = "keel.io/spec-hash";

/// Kinds of objects the phases manage
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    /// apps/v1 Deployment
    Deployment,
    /// apps/v1 DaemonSet
    DaemonSet,
    /// v1 Service
    Service,
    /// v1 ConfigMap
    ConfigMap,
    /// v1 Secret
    Secret,
    /// v1 ServiceAccount
    ServiceAccount,
    /// rbac/v1 ClusterRole
    ClusterRole,
    /// rbac/v1 ClusterRoleBinding
    ClusterRoleBinding,
}

impl ObjectKind {
    /// Kind name as the API server spells it
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deployment => "Deployment",
            Self::DaemonSet => "DaemonSet",
            Self::Service => "Service",
            Self::ConfigMap => "ConfigMap",
            Self::Secret => "Secret",
            Self::ServiceAccount => "ServiceAccount",
            Self::ClusterRole => "ClusterRole",
            Self::ClusterRoleBinding => "ClusterRoleBinding",
        }
    }

    /// Whether objects of this kind live in a namespace
    pub fn is_namespaced(&self) -> bool {
        !matches!(self, Self::ClusterRole | Self::ClusterRoleBinding)
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a stored object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Object kind
    pub kind: ObjectKind,
    /// Namespace, `None` for cluster scoped kinds
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// An object the phases can reconcile
#[derive(Clone, Debug, PartialEq)]
pub enum ManagedObject {
    /// Deployment
    Deployment(Deployment),
    /// DaemonSet
    DaemonSet(DaemonSet),
    /// Service
    Service(Service),
    /// ConfigMap
    ConfigMap(ConfigMap),
    /// Secret
    Secret(Secret),
    /// ServiceAccount
    ServiceAccount(ServiceAccount),
    /// ClusterRole
    ClusterRole(ClusterRole),
    /// ClusterRoleBinding
    ClusterRoleBinding(ClusterRoleBinding),
}

macro_rules! each_object {
    ($obj:expr, $inner:ident => $body:expr) => {
        match $obj {
            ManagedObject::Deployment($inner) => $body,
            ManagedObject::DaemonSet($inner) => $body,
            ManagedObject::Service($inner) => $body,
            ManagedObject::ConfigMap($inner) => $body,
            ManagedObject::Secret($inner) => $body,
            ManagedObject::ServiceAccount($inner) => $body,
            ManagedObject::ClusterRole($inner) => $body,
            ManagedObject::ClusterRoleBinding($inner) => $body,
        }
    };
}

impl ManagedObject {
    /// Kind of the wrapped object
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Deployment(_) => ObjectKind::Deployment,
            Self::DaemonSet(_) => ObjectKind::DaemonSet,
            Self::Service(_) => ObjectKind::Service,
            Self::ConfigMap(_) => ObjectKind::ConfigMap,
            Self::Secret(_) => ObjectKind::Secret,
            Self::ServiceAccount(_) => ObjectKind::ServiceAccount,
            Self::ClusterRole(_) => ObjectKind::ClusterRole,
            Self::ClusterRoleBinding(_) => ObjectKind::ClusterRoleBinding,
        }
    }

    /// Object metadata
    pub fn metadata(&self) -> &ObjectMeta {
        each_object!(self, o => &o.metadata)
    }

    /// Mutable object metadata
    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        each_object!(self, o => &mut o.metadata)
    }

    /// Object name, empty when unset
    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    /// Store identity of the object
    pub fn key(&self) -> ObjectKey {
        let kind = self.kind();
        ObjectKey {
            kind,
            namespace: if kind.is_namespaced() {
                self.metadata().namespace.clone()
            } else {
                None
            },
            name: self.name().to_string(),
        }
    }

    /// Hash of the workload spec, for kinds compared by hash
    fn spec_hash(&self) -> Result<Option<String>, Error> {
        let serialized = match self {
            Self::Deployment(d) => serde_json::to_vec(&d.spec),
            Self::DaemonSet(d) => serde_json::to_vec(&d.spec),
            _ => return Ok(None),
        }
        .map_err(|e| Error::serialization_for_kind(self.kind().as_str(), e.to_string()))?;

        let digest = Sha256::digest(&serialized);
        Ok(Some(hex::encode(&digest[..8])))
    }

    /// Record the workload spec hash annotation
    pub fn with_spec_hash(mut self) -> Result<Self, Error> {
        if let Some(hash) = self.spec_hash()? {
            self.metadata_mut()
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .insert(SPEC_HASH_ANNOTATION.to_string(), hash);
        }
        Ok(self)
    }

    /// Whether the live object differs from this desired object in a field
    /// reconciliation controls
    ///
    /// Desired labels and annotations must be present on the live object;
    /// extra live metadata is left alone.
    pub fn diverges_from(&self, live: &ManagedObject) -> bool {
        if !is_subset(&self.metadata().labels, &live.metadata().labels)
            || !is_subset(&self.metadata().annotations, &live.metadata().annotations)
        {
            return true;
        }

        match (self, live) {
            // Compared through SPEC_HASH_ANNOTATION above
            (Self::Deployment(_), Self::Deployment(_)) => false,
            (Self::DaemonSet(_), Self::DaemonSet(_)) => false,
            (Self::Service(want), Self::Service(have)) => {
                let want = want.spec.clone().unwrap_or_default();
                let have = have.spec.clone().unwrap_or_default();
                want.selector != have.selector
                    || want.type_.as_deref().unwrap_or("ClusterIP")
                        != have.type_.as_deref().unwrap_or("ClusterIP")
                    || normalized_ports(&want.ports) != normalized_ports(&have.ports)
            }
            (Self::ConfigMap(want), Self::ConfigMap(have)) => {
                want.data != have.data || want.binary_data != have.binary_data
            }
            (Self::Secret(want), Self::Secret(have)) => {
                want.data != have.data
                    || (want.type_.is_some() && want.type_ != have.type_)
            }
            (Self::ServiceAccount(_), Self::ServiceAccount(_)) => false,
            (Self::ClusterRole(want), Self::ClusterRole(have)) => {
                want.rules != have.rules || want.aggregation_rule != have.aggregation_rule
            }
            (Self::ClusterRoleBinding(want), Self::ClusterRoleBinding(have)) => {
                want.role_ref != have.role_ref || want.subjects != have.subjects
            }
            _ => true,
        }
    }

    /// Copy server-owned fields from the live object before an update
    pub fn carry_live_fields(&mut self, live: &ManagedObject) {
        self.metadata_mut().resource_version = live.metadata().resource_version.clone();

        if let (Self::Service(want), Self::Service(have)) = (self, live) {
            let Some(have_spec) = have.spec.as_ref() else {
                return;
            };
            let want_spec = want.spec.get_or_insert_with(Default::default);
            if want_spec.cluster_ip.is_none() {
                want_spec.cluster_ip = have_spec.cluster_ip.clone();
                want_spec.cluster_ips = have_spec.cluster_ips.clone();
            }
            if let (Some(want_ports), Some(have_ports)) =
                (want_spec.ports.as_mut(), have_spec.ports.as_ref())
            {
                for port in want_ports.iter_mut().filter(|p| p.node_port.is_none()) {
                    port.node_port = have_ports
                        .iter()
                        .find(|p| p.port == port.port && p.name == port.name)
                        .and_then(|p| p.node_port);
                }
            }
        }
    }
}

fn is_subset(
    want: &Option<BTreeMap<String, String>>,
    have: &Option<BTreeMap<String, String>>,
) -> bool {
    let Some(want) = want else {
        return true;
    };
    let empty = BTreeMap::new();
    let have = have.as_ref().unwrap_or(&empty);
    want.iter().all(|(k, v)| have.get(k) == Some(v))
}

/// Service ports with server defaults applied
fn normalized_ports(
    ports: &Option<Vec<ServicePort>>,
) -> Vec<(Option<String>, i32, String, IntOrString)> {
    ports
        .iter()
        .flatten()
        .map(|p| {
            (
                p.name.clone(),
                p.port,
                p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
                p.target_port.clone().unwrap_or(IntOrString::Int(p.port)),
            )
        })
        .collect()
}

/// Get/list/create/update access to one cluster's objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object, `None` when it does not exist
    async fn get(&self, key: &ObjectKey) -> Result<Option<ManagedObject>, Error>;

    /// List objects of a kind, optionally within one namespace
    async fn list(
        &self,
        kind: ObjectKind,
        namespace: Option<String>,
    ) -> Result<Vec<ManagedObject>, Error>;

    /// Create an object
    async fn create(&self, object: &ManagedObject) -> Result<(), Error>;

    /// Replace an existing object; a stale resourceVersion is `Error::Conflict`
    async fn update(&self, object: &ManagedObject) -> Result<(), Error>;
}

/// Node access on a target cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeApi: Send + Sync {
    /// Fetch a node by name, `None` when it does not exist
    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error>;

    /// List every node
    async fn list_nodes(&self) -> Result<Vec<Node>, Error>;

    /// Replace a node; a stale resourceVersion is `Error::Conflict`
    async fn replace_node(&self, node: &Node) -> Result<(), Error>;
}

/// Store backed by a kube client
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, key: &ObjectKey) -> Result<Api<K>, Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        match key.namespace.as_deref() {
            Some(ns) => Ok(Api::namespaced(self.client.clone(), ns)),
            None => Err(Error::internal_with_context(
                "kube_store",
                format!("{} has no namespace", key),
            )),
        }
    }

    fn listing<K>(&self, namespace: Option<&str>) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn cluster<K>(&self) -> Api<K>
    where
        K: Resource<DynamicType = ()>,
    {
        Api::all(self.client.clone())
    }
}

fn store_error(kind: &str, name: &str, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 409 => Error::conflict(kind, name, ae.message),
        other => Error::from(other),
    }
}

async fn get_from<K>(api: &Api<K>, name: &str) -> Result<Option<K>, Error>
where
    K: Clone + DeserializeOwned + Debug,
{
    Ok(api.get_opt(name).await?)
}

async fn list_from<K>(api: &Api<K>) -> Result<Vec<K>, Error>
where
    K: Clone + DeserializeOwned + Debug,
{
    Ok(api.list(&ListParams::default()).await?.items)
}

async fn create_in<K>(api: &Api<K>, key: &ObjectKey, object: &K) -> Result<(), Error>
where
    K: Clone + DeserializeOwned + Serialize + Debug,
{
    api.create(&PostParams::default(), object)
        .await
        .map(|_| ())
        .map_err(|e| store_error(key.kind.as_str(), &key.name, e))
}

async fn replace_in<K>(api: &Api<K>, key: &ObjectKey, object: &K) -> Result<(), Error>
where
    K: Clone + DeserializeOwned + Serialize + Debug,
{
    api.replace(&key.name, &PostParams::default(), object)
        .await
        .map(|_| ())
        .map_err(|e| store_error(key.kind.as_str(), &key.name, e))
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<ManagedObject>, Error> {
        let name = key.name.as_str();
        let object = match key.kind {
            ObjectKind::Deployment => get_from(&self.namespaced::<Deployment>(key)?, name)
                .await?
                .map(ManagedObject::Deployment),
            ObjectKind::DaemonSet => get_from(&self.namespaced::<DaemonSet>(key)?, name)
                .await?
                .map(ManagedObject::DaemonSet),
            ObjectKind::Service => get_from(&self.namespaced::<Service>(key)?, name)
                .await?
                .map(ManagedObject::Service),
            ObjectKind::ConfigMap => get_from(&self.namespaced::<ConfigMap>(key)?, name)
                .await?
                .map(ManagedObject::ConfigMap),
            ObjectKind::Secret => get_from(&self.namespaced::<Secret>(key)?, name)
                .await?
                .map(ManagedObject::Secret),
            ObjectKind::ServiceAccount => get_from(&self.namespaced::<ServiceAccount>(key)?, name)
                .await?
                .map(ManagedObject::ServiceAccount),
            ObjectKind::ClusterRole => get_from(&self.cluster::<ClusterRole>(), name)
                .await?
                .map(ManagedObject::ClusterRole),
            ObjectKind::ClusterRoleBinding => get_from(&self.cluster::<ClusterRoleBinding>(), name)
                .await?
                .map(ManagedObject::ClusterRoleBinding),
        };
        Ok(object)
    }

    async fn list(
        &self,
        kind: ObjectKind,
        namespace: Option<String>,
    ) -> Result<Vec<ManagedObject>, Error> {
        let ns = namespace.as_deref();
        let objects = match kind {
            ObjectKind::Deployment => list_from(&self.listing::<Deployment>(ns))
                .await?
                .into_iter()
                .map(ManagedObject::Deployment)
                .collect(),
            ObjectKind::DaemonSet => list_from(&self.listing::<DaemonSet>(ns))
                .await?
                .into_iter()
                .map(ManagedObject::DaemonSet)
                .collect(),
            ObjectKind::Service => list_from(&self.listing::<Service>(ns))
                .await?
                .into_iter()
                .map(ManagedObject::Service)
                .collect(),
            ObjectKind::ConfigMap => list_from(&self.listing::<ConfigMap>(ns))
                .await?
                .into_iter()
                .map(ManagedObject::ConfigMap)
                .collect(),
            ObjectKind::Secret => list_from(&self.listing::<Secret>(ns))
                .await?
                .into_iter()
                .map(ManagedObject::Secret)
                .collect(),
            ObjectKind::ServiceAccount => list_from(&self.listing::<ServiceAccount>(ns))
                .await?
                .into_iter()
                .map(ManagedObject::ServiceAccount)
                .collect(),
            ObjectKind::ClusterRole => list_from(&self.cluster::<ClusterRole>())
                .await?
                .into_iter()
                .map(ManagedObject::ClusterRole)
                .collect(),
            ObjectKind::ClusterRoleBinding => list_from(&self.cluster::<ClusterRoleBinding>())
                .await?
                .into_iter()
                .map(ManagedObject::ClusterRoleBinding)
                .collect(),
        };
        Ok(objects)
    }

    async fn create(&self, object: &ManagedObject) -> Result<(), Error> {
        let key = object.key();
        match object {
            ManagedObject::Deployment(o) => create_in(&self.namespaced(&key)?, &key, o).await,
            ManagedObject::DaemonSet(o) => create_in(&self.namespaced(&key)?, &key, o).await,
            ManagedObject::Service(o) => create_in(&self.namespaced(&key)?, &key, o).await,
            ManagedObject::ConfigMap(o) => create_in(&self.namespaced(&key)?, &key, o).await,
            ManagedObject::Secret(o) => create_in(&self.namespaced(&key)?, &key, o).await,
            ManagedObject::ServiceAccount(o) => {
                create_in(&self.namespaced(&key)?, &key, o).await
            }
            ManagedObject::ClusterRole(o) => create_in(&self.cluster(), &key, o).await,
            ManagedObject::ClusterRoleBinding(o) => create_in(&self.cluster(), &key, o).await,
        }
    }

    async fn update(&self, object: &ManagedObject) -> Result<(), Error> {
        let key = object.key();
        match object {
            ManagedObject::Deployment(o) => replace_in(&self.namespaced(&key)?, &key, o).await,
            ManagedObject::DaemonSet(o) => replace_in(&self.namespaced(&key)?, &key, o).await,
            ManagedObject::Service(o) => replace_in(&self.namespaced(&key)?, &key, o).await,
            ManagedObject::ConfigMap(o) => replace_in(&self.namespaced(&key)?, &key, o).await,
            ManagedObject::Secret(o) => replace_in(&self.namespaced(&key)?, &key, o).await,
            ManagedObject::ServiceAccount(o) => {
                replace_in(&self.namespaced(&key)?, &key, o).await
            }
            ManagedObject::ClusterRole(o) => replace_in(&self.cluster(), &key, o).await,
            ManagedObject::ClusterRoleBinding(o) => replace_in(&self.cluster(), &key, o).await,
        }
    }
}

#[async_trait]
impl NodeApi for KubeStore {
    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error> {
        get_from(&self.cluster::<Node>(), name).await
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, Error> {
        list_from(&self.cluster::<Node>()).await
    }

    async fn replace_node(&self, node: &Node) -> Result<(), Error> {
        let name = node.metadata.name.clone().unwrap_or_default();
        self.cluster::<Node>()
            .replace(&name, &PostParams::default(), node)
            .await
            .map(|_| ())
            .map_err(|e| store_error("Node", &name, e))
    }
}

/// Mutating calls observed by a [`MemoryStore`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MutationCounts {
    /// Successful creates
    pub creates: usize,
    /// Successful object updates
    pub updates: usize,
    /// Successful node replaces
    pub node_updates: usize,
}

#[derive(Default)]
struct MemoryState {
    objects: BTreeMap<ObjectKey, ManagedObject>,
    nodes: BTreeMap<String, Node>,
    counts: MutationCounts,
    next_version: u64,
    next_service_ip: u8,
}

impl MemoryState {
    fn bump_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

/// In-memory store with API server style optimistic concurrency
///
/// Assigns resourceVersions and Service clusterIPs the way the API server
/// does and counts mutating calls. Used by tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutating calls observed so far
    pub fn mutations(&self) -> MutationCounts {
        self.lock().counts
    }

    /// Stored object by key
    pub fn object(&self, key: &ObjectKey) -> Option<ManagedObject> {
        self.lock().objects.get(key).cloned()
    }

    /// Keys of every stored object
    pub fn keys(&self) -> Vec<ObjectKey> {
        self.lock().objects.keys().cloned().collect()
    }

    /// Add or overwrite a node without counting a mutation
    pub fn insert_node(&self, mut node: Node) {
        let mut state = self.lock();
        node.metadata.resource_version = Some(state.bump_version());
        let name = node.metadata.name.clone().unwrap_or_default();
        state.nodes.insert(name, node);
    }

    /// Stored node by name
    pub fn node(&self, name: &str) -> Option<Node> {
        self.lock().nodes.get(name).cloned()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<ManagedObject>, Error> {
        Ok(self.object(key))
    }

    async fn list(
        &self,
        kind: ObjectKind,
        namespace: Option<String>,
    ) -> Result<Vec<ManagedObject>, Error> {
        Ok(self
            .lock()
            .objects
            .iter()
            .filter(|(k, _)| k.kind == kind)
            .filter(|(k, _)| namespace.is_none() || k.namespace == namespace)
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn create(&self, object: &ManagedObject) -> Result<(), Error> {
        let key = object.key();
        let mut state = self.lock();
        if state.objects.contains_key(&key) {
            return Err(Error::conflict(
                key.kind.as_str(),
                &key.name,
                "already exists",
            ));
        }

        let mut stored = object.clone();
        stored.metadata_mut().resource_version = Some(state.bump_version());
        if let ManagedObject::Service(svc) = &mut stored {
            let spec = svc.spec.get_or_insert_with(Default::default);
            if spec.cluster_ip.is_none() {
                state.next_service_ip = state.next_service_ip.wrapping_add(1);
                let ip = format!("10.96.0.{}", state.next_service_ip);
                spec.cluster_ips = Some(vec![ip.clone()]);
                spec.cluster_ip = Some(ip);
            }
        }
        state.objects.insert(key, stored);
        state.counts.creates += 1;
        Ok(())
    }

    async fn update(&self, object: &ManagedObject) -> Result<(), Error> {
        let key = object.key();
        let mut state = self.lock();
        let current = state
            .objects
            .get(&key)
            .map(|o| o.metadata().resource_version.clone())
            .ok_or_else(|| {
                Error::internal_with_context("memory_store", format!("{} not found", key))
            })?;

        let requested = &object.metadata().resource_version;
        if requested.is_some() && *requested != current {
            return Err(Error::conflict(
                key.kind.as_str(),
                &key.name,
                "the object has been modified",
            ));
        }

        let mut stored = object.clone();
        stored.metadata_mut().resource_version = Some(state.bump_version());
        state.objects.insert(key, stored);
        state.counts.updates += 1;
        Ok(())
    }
}

#[async_trait]
impl NodeApi for MemoryStore {
    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error> {
        Ok(self.node(name))
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, Error> {
        Ok(self.lock().nodes.values().cloned().collect())
    }

    async fn replace_node(&self, node: &Node) -> Result<(), Error> {
        let name = node.metadata.name.clone().unwrap_or_default();
        let mut state = self.lock();
        let current = state
            .nodes
            .get(&name)
            .map(|n| n.metadata.resource_version.clone())
            .ok_or_else(|| {
                Error::internal_with_context("memory_store", format!("Node {} not found", name))
            })?;
        if node.metadata.resource_version.is_some() && node.metadata.resource_version != current
        {
            return Err(Error::conflict("Node", &name, "the object has been modified"));
        }

        let mut stored = node.clone();
        stored.metadata.resource_version = Some(state.bump_version());
        state.nodes.insert(name, stored);
        state.counts.node_updates += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::ServiceSpec;
    use k8s_openapi::api::rbac::v1::{PolicyRule, RoleRef, Subject};
    use k8s_openapi::ByteString;

    use super::*;

    fn meta(name: &str, ns: Option<&str>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: ns.map(String::from),
            ..Default::default()
        }
    }

    fn service(port: i32) -> ManagedObject {
        ManagedObject::Service(Service {
            metadata: meta("kube-apiserver", Some("c1")),
            spec: Some(ServiceSpec {
                selector: Some(BTreeMap::from([("app".to_string(), "api".to_string())])),
                ports: Some(vec![ServicePort {
                    name: Some("https".to_string()),
                    port,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    #[test]
    fn cluster_scoped_keys_drop_namespace() {
        let role = ManagedObject::ClusterRole(ClusterRole {
            metadata: meta("flannel", Some("ignored")),
            ..Default::default()
        });
        let key = role.key();
        assert_eq!(key.namespace, None);
        assert_eq!(key.to_string(), "ClusterRole flannel");

        assert_eq!(service(443).key().to_string(), "Service c1/kube-apiserver");
    }

    #[test]
    fn service_divergence_ignores_server_defaults() {
        let desired = service(6443);
        let mut live = desired.clone();
        if let ManagedObject::Service(svc) = &mut live {
            let spec = svc.spec.as_mut().unwrap();
            spec.cluster_ip = Some("10.96.0.4".to_string());
            let port = &mut spec.ports.as_mut().unwrap()[0];
            port.protocol = Some("TCP".to_string());
            port.target_port = Some(IntOrString::Int(6443));
        }
        assert!(!desired.diverges_from(&live));
        assert!(service(16443).diverges_from(&live));
    }

    #[test]
    fn labels_must_be_present_on_live_object() {
        let mut desired = service(6443);
        desired
            .metadata_mut()
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert("tier".to_string(), "control-plane".to_string());
        let live = service(6443);
        assert!(desired.diverges_from(&live));
        assert!(!live.diverges_from(&desired));
    }

    #[test]
    fn secret_and_rbac_divergence() {
        let secret = |v: &str| {
            ManagedObject::Secret(Secret {
                metadata: meta("certs", Some("c1")),
                data: Some(BTreeMap::from([(
                    "ca.crt".to_string(),
                    ByteString(v.as_bytes().to_vec()),
                )])),
                ..Default::default()
            })
        };
        assert!(!secret("a").diverges_from(&secret("a")));
        assert!(secret("a").diverges_from(&secret("b")));

        let binding = |role: &str| {
            ManagedObject::ClusterRoleBinding(ClusterRoleBinding {
                metadata: meta("b", None),
                role_ref: RoleRef {
                    api_group: "rbac.authorization.k8s.io".to_string(),
                    kind: "ClusterRole".to_string(),
                    name: role.to_string(),
                },
                subjects: Some(vec![Subject {
                    kind: "ServiceAccount".to_string(),
                    name: "flannel".to_string(),
                    namespace: Some("kube-system".to_string()),
                    ..Default::default()
                }]),
            })
        };
        assert!(binding("flannel").diverges_from(&binding("admin")));

        let role = |verbs: Vec<&str>| {
            ManagedObject::ClusterRole(ClusterRole {
                metadata: meta("r", None),
                rules: Some(vec![PolicyRule {
                    verbs: verbs.into_iter().map(String::from).collect(),
                    ..Default::default()
                }]),
                ..Default::default()
            })
        };
        assert!(!role(vec!["get"]).diverges_from(&role(vec!["get"])));
        assert!(role(vec!["get", "list"]).diverges_from(&role(vec!["get"])));
    }

    #[test]
    fn kind_mismatch_always_diverges() {
        let cm = ManagedObject::ConfigMap(ConfigMap {
            metadata: meta("kube-apiserver", Some("c1")),
            ..Default::default()
        });
        assert!(cm.diverges_from(&service(6443)));
    }

    #[test]
    fn spec_hash_tracks_workload_spec() {
        let deployment = |replicas: i32| {
            ManagedObject::Deployment(Deployment {
                metadata: meta("kube-scheduler", Some("c1")),
                spec: Some(k8s_openapi::api::apps::v1::DeploymentSpec {
                    replicas: Some(replicas),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .with_spec_hash()
            .unwrap()
        };
        let one = deployment(1);
        assert!(one.metadata().annotations.as_ref().unwrap().contains_key(SPEC_HASH_ANNOTATION));
        assert!(!one.diverges_from(&deployment(1)));
        assert!(deployment(2).diverges_from(&one));
    }

    #[test]
    fn carry_live_fields_keeps_cluster_ip_and_version() {
        let mut desired = service(6443);
        let mut live = service(6443);
        live.metadata_mut().resource_version = Some("7".to_string());
        if let ManagedObject::Service(svc) = &mut live {
            svc.spec.as_mut().unwrap().cluster_ip = Some("10.96.0.9".to_string());
        }

        desired.carry_live_fields(&live);
        assert_eq!(desired.metadata().resource_version.as_deref(), Some("7"));
        match desired {
            ManagedObject::Service(svc) => {
                assert_eq!(svc.spec.unwrap().cluster_ip.as_deref(), Some("10.96.0.9"));
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn memory_store_rejects_stale_updates() {
        let store = MemoryStore::new();
        store.create(&service(6443)).await.unwrap();
        let live = store.get(&service(6443).key()).await.unwrap().unwrap();

        let mut first = service(7443);
        first.carry_live_fields(&live);
        store.update(&first).await.unwrap();

        let mut stale = service(8443);
        stale.carry_live_fields(&live);
        let err = store.update(&stale).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        assert_eq!(
            store.mutations(),
            MutationCounts {
                creates: 1,
                updates: 1,
                node_updates: 0
            }
        );
    }

    #[tokio::test]
    async fn memory_store_create_twice_conflicts() {
        let store = MemoryStore::new();
        store.create(&service(6443)).await.unwrap();
        let err = store.create(&service(6443)).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        assert_eq!(store.list(ObjectKind::Service, None).await.unwrap().len(), 1);
    }
}
