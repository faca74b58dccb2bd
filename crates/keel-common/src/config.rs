//! Provider configuration shared by every pipeline invocation
//!
//! Loaded from YAML; the `KEEL_CONFIG` environment variable names the file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, KUBERNETES_DIR};

/// Environment variable naming the provider config file
pub const CONFIG_ENV: &str = "KEEL_CONFIG";

/// Private image registry reachable from every machine
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    /// Registry domain (e.g., "registry.example.com")
    #[serde(default)]
    pub domain: String,
    /// Registry IP; when set, machines get explicit hosts entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Repository namespace for control-plane images
    #[serde(default = "default_registry_namespace")]
    pub namespace: String,
}

fn default_registry_namespace() -> String {
    "library".to_string()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            domain: String::new(),
            ip: None,
            namespace: default_registry_namespace(),
        }
    }
}

/// Node readiness polling bounds, in seconds
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeReadyConfig {
    /// Seconds between node polls
    pub interval_secs: u64,
    /// Seconds before giving up
    pub timeout_secs: u64,
}

impl Default for NodeReadyConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            timeout_secs: 300,
        }
    }
}

/// Global configuration handed to every phase and external collaborator
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    /// Image registry
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Node readiness polling
    #[serde(default)]
    pub node_ready: NodeReadyConfig,
    /// Directory of installed kubernetes state on machines
    #[serde(default = "default_kubernetes_dir")]
    pub kubernetes_dir: String,
    /// Replicas of each hosted control-plane Deployment
    #[serde(default = "default_control_plane_replicas")]
    pub control_plane_replicas: i32,
}

fn default_kubernetes_dir() -> String {
    KUBERNETES_DIR.to_string()
}

fn default_control_plane_replicas() -> i32 {
    1
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            node_ready: NodeReadyConfig::default(),
            kubernetes_dir: default_kubernetes_dir(),
            control_plane_replicas: default_control_plane_replicas(),
        }
    }
}

impl ProviderConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(input: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(input)
            .map_err(|e| Error::serialization_for_kind("ProviderConfig", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Load from the file named by `KEEL_CONFIG`, or use defaults when unset
    pub fn from_env() -> Result<Self, Error> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(Path::new(&path)),
            None => {
                debug!("{} not set, using default provider config", CONFIG_ENV);
                Ok(Self::default())
            }
        }
    }

    /// Reject settings no pipeline can run with
    pub fn validate(&self) -> Result<(), Error> {
        if self.node_ready.interval_secs == 0 {
            return Err(Error::configuration(
                "nodeReady.intervalSecs must be greater than 0",
            ));
        }
        if self.node_ready.interval_secs > self.node_ready.timeout_secs {
            return Err(Error::configuration(
                "nodeReady.intervalSecs must not exceed nodeReady.timeoutSecs",
            ));
        }
        if self.control_plane_replicas < 1 {
            return Err(Error::configuration(
                "controlPlaneReplicas must be at least 1",
            ));
        }
        Ok(())
    }

    /// Whether machines need explicit hosts entries for the registry
    pub fn need_set_hosts(&self) -> bool {
        !self.registry.domain.is_empty()
            && self.registry.ip.as_deref().is_some_and(|ip| !ip.is_empty())
    }

    /// Image reference for a control-plane component
    pub fn image(&self, name: &str, tag: &str) -> String {
        if self.registry.domain.is_empty() {
            format!("registry.k8s.io/{}:{}", name, tag)
        } else {
            format!(
                "{}/{}/{}:{}",
                self.registry.domain, self.registry.namespace, name, tag
            )
        }
    }

    /// Node ready poll interval
    pub fn node_ready_interval(&self) -> Duration {
        Duration::from_secs(self.node_ready.interval_secs)
    }

    /// Node ready timeout
    pub fn node_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.node_ready.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_empty_document() {
        let config = ProviderConfig::from_yaml_str("{}").expect("empty config is valid");
        assert_eq!(config, ProviderConfig::default());
        assert_eq!(config.registry.namespace, "library");
        assert_eq!(config.node_ready_timeout(), Duration::from_secs(300));
        assert!(!config.need_set_hosts());
    }

    #[test]
    fn registry_namespace_defaults_when_only_domain_is_set() {
        let config = ProviderConfig::from_yaml_str("registry:\n  domain: registry.keel.local\n")
            .expect("config should parse");
        assert_eq!(config.registry.namespace, "library");
        assert_eq!(RegistryConfig::default().namespace, "library");
    }

    #[test]
    fn registry_with_ip_needs_hosts() {
        let config = ProviderConfig::from_yaml_str(
            r#"
registry:
  domain: registry.keel.local
  ip: 10.10.0.5
nodeReady:
  intervalSecs: 2
  timeoutSecs: 60
"#,
        )
        .expect("config should parse");
        assert!(config.need_set_hosts());
        assert_eq!(config.node_ready_interval(), Duration::from_secs(2));
        assert_eq!(
            config.image("kube-apiserver", "v1.32.0"),
            "registry.keel.local/library/kube-apiserver:v1.32.0"
        );
    }

    #[test]
    fn invalid_polling_is_rejected() {
        let err = ProviderConfig::from_yaml_str(
            "nodeReady:\n  intervalSecs: 10\n  timeoutSecs: 5\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn malformed_yaml_is_a_serialization_error() {
        let err = ProviderConfig::from_yaml_str("registry: [").unwrap_err();
        assert!(matches!(err, Error::Serialization { .. }));
    }

    #[test]
    fn default_image_uses_upstream_registry() {
        let config = ProviderConfig::default();
        assert_eq!(
            config.image("kube-scheduler", "v1.32.0"),
            "registry.k8s.io/kube-scheduler:v1.32.0"
        );
    }
}
