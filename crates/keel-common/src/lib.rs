//! Common types for keel: CRDs, credentials, errors, and utilities

#![deny(missing_docs)]

pub mod conditions;
pub mod config;
pub mod credential;
pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod network;
pub mod telemetry;

pub use config::ProviderConfig;
pub use credential::ClusterCredential;
pub use crd::ClusterRecord;
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Port the API server listens on when no third-party VIP port is configured
pub const DEFAULT_API_PORT: u16 = 6443;

/// Offset of the cluster DNS service address within the service CIDR
pub const DNS_IP_INDEX: u32 = 10;

/// Offset of the `kubernetes` service address within the service CIDR
pub const API_SERVICE_IP_INDEX: u32 = 1;

/// Name of the hosted API server (Deployment, Service and in-cluster DNS host)
pub const KUBE_APISERVER: &str = "kube-apiserver";

/// Name of the hosted controller manager Deployment
pub const KUBE_CONTROLLER_MANAGER: &str = "kube-controller-manager";

/// Name of the hosted scheduler Deployment
pub const KUBE_SCHEDULER: &str = "kube-scheduler";

/// Key in `ClusterCredential::ext_data` holding the kubeconfig bound to the external VIP
pub const EXTERNAL_ADMIN_KUBECONFIG: &str = "external-admin.kubeconfig";

/// Directory holding installed kubernetes state on a machine
pub const KUBERNETES_DIR: &str = "/etc/kubernetes";

/// Label key marking resources managed by keel
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`] on keel-managed resources
pub const MANAGED_BY_VALUE: &str = "keel";
