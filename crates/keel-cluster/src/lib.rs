//! Keel Cluster - provisioning phases for managed Kubernetes clusters
//!
//! - **Derivation**: service CIDR, node mask, DNS address, API server
//!   addresses and cluster credentials from the declared spec
//! - **Cluster pipeline**: certificates, kubeconfigs, the hosted control plane
//!   and addons, reconciled into the management and target clusters
//! - **Machine pipeline**: preparing a host over a remote execution channel,
//!   joining it and waiting for its node to become Ready
//!
//! Every phase is an idempotent ensure step; a pipeline is safe to re-run
//! after any failure.

pub mod addons;
pub mod control_plane;
pub mod derive;
pub mod endpoint;
pub mod ids;
pub mod installer;
pub mod kubeconfig;
pub mod phases;
pub mod pki;
pub mod reconcile;
pub mod registry;
pub mod remote;
pub mod store;

pub use addons::{AddonBuilder, AddonSet, StaticAddon};
pub use derive::{derive_cluster_state, regenerate_credentials};
pub use endpoint::{join_endpoint, master_endpoint, select_address};
pub use ids::{IdGenerator, SecureIdGenerator};
pub use phases::{
    ClusterContext, ClusterContextBuilder, ClusterStep, MachineContext, MachineContextBuilder,
    MachineStep,
};
pub use reconcile::{ensure_all, ensure_present, ReconcileOutcome};
pub use registry::{ClusterRegistry, StaticRegistry, TargetCluster};
pub use remote::{ExecOutput, RemoteConnector, RemoteExec};
pub use store::{KubeStore, ManagedObject, MemoryStore, NodeApi, ObjectKey, ObjectKind, ObjectStore};

pub use keel_common::{Error, Result};
