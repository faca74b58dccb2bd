//! Error types for keel provisioning
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the cluster, host or object it concerns so the
//! calling controller can record a condition and decide on retry.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for keel operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Bad or insufficient declared spec (CIDR too small, missing HA config)
    #[error("configuration error for {cluster}: {message}")]
    Configuration {
        /// Name of the cluster with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.clusterCIDR")
        field: Option<String>,
    },

    /// Random source or key generation failure
    #[error("crypto error: {message}")]
    Crypto {
        /// Description of what failed
        message: String,
    },

    /// Remote host could not be reached
    #[error("connection error [{host}]: {message}")]
    Connection {
        /// Host that could not be reached
        host: String,
        /// Description of what failed
        message: String,
    },

    /// A remote command failed or returned a non-zero exit code
    #[error("remote command {command:?} failed on {host}: exit {exit_code}: stderr {stderr}")]
    RemoteCommand {
        /// Host the command ran on
        host: String,
        /// The command line
        command: String,
        /// Remote exit code (-1 when the transport failed before one was known)
        exit_code: i32,
        /// Captured stderr, or the transport error
        stderr: String,
    },

    /// Concurrent-mutation conflict on the declarative store
    #[error("conflict updating {kind} {name}: {message}")]
    Conflict {
        /// Object kind
        kind: String,
        /// Namespaced name of the object
        name: String,
        /// Server message
        message: String,
    },

    /// A bounded wait was exceeded
    #[error("timed out [{operation}]: {message}")]
    Timeout {
        /// The wait that timed out (e.g., "node_ready")
        operation: String,
        /// Description of what never happened
        message: String,
    },

    /// Endpoint selection found no candidate address
    #[error("no advertise or real address for cluster {cluster}")]
    NoAddress {
        /// Name of the cluster without addresses
        cluster: String,
    },

    /// The target cluster's client is not available yet
    #[error("target cluster {cluster} is not ready: {message}")]
    NotReady {
        /// Name of the target cluster
        cluster: String,
        /// Why the client is not available
        message: String,
    },

    /// The caller cancelled the operation
    #[error("operation cancelled [{context}]")]
    Cancelled {
        /// Where the cancellation was observed
        context: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// A pipeline phase failed
    #[error("phase {phase} failed for {target}: {source}")]
    Phase {
        /// Name of the failed phase
        phase: String,
        /// Cluster name or machine host the phase ran against
        target: String,
        /// The underlying cause
        #[source]
        source: Box<Error>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            cluster: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a configuration error with cluster context
    pub fn configuration_for(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            cluster: cluster.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a configuration error with cluster context and field path
    pub fn configuration_for_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Configuration {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a crypto error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Self::Crypto {
            message: msg.into(),
        }
    }

    /// Create a connection error for a host
    pub fn connection(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Connection {
            host: host.into(),
            message: msg.into(),
        }
    }

    /// Create a remote command error
    pub fn remote_command(
        host: impl Into<String>,
        command: impl Into<String>,
        exit_code: i32,
        stderr: impl Into<String>,
    ) -> Self {
        Self::RemoteCommand {
            host: host.into(),
            command: command.into(),
            exit_code,
            stderr: stderr.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(
        kind: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a no-address error
    pub fn no_address(cluster: impl Into<String>) -> Self {
        Self::NoAddress {
            cluster: cluster.into(),
        }
    }

    /// Create a not-ready error for a target cluster
    pub fn not_ready(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::NotReady {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(context: impl Into<String>) -> Self {
        Self::Cancelled {
            context: context.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Wrap an error with the phase and target it occurred in
    pub fn in_phase(self, phase: impl Into<String>, target: impl Into<String>) -> Self {
        Self::Phase {
            phase: phase.into(),
            target: target.into(),
            source: Box::new(self),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// The innermost error, looking through phase wrapping
    pub fn root(&self) -> &Error {
        match self {
            Error::Phase { source, .. } => source.root(),
            other => other,
        }
    }

    /// True when the target cluster's client is simply not available yet
    pub fn is_not_ready(&self) -> bool {
        matches!(self.root(), Error::NotReady { .. })
    }

    /// Stable short name of the error kind, used as a condition reason
    pub fn kind(&self) -> &'static str {
        match self.root() {
            Error::Kube { .. } => "KubeError",
            Error::Configuration { .. } => "ConfigurationError",
            Error::Crypto { .. } => "CryptoError",
            Error::Connection { .. } => "ConnectionError",
            Error::RemoteCommand { .. } => "RemoteCommandError",
            Error::Conflict { .. } => "ConflictError",
            Error::Timeout { .. } => "TimeoutError",
            Error::NoAddress { .. } => "NoAddressError",
            Error::NotReady { .. } => "NotReady",
            Error::Cancelled { .. } => "Cancelled",
            Error::Serialization { .. } => "SerializationError",
            Error::Internal { .. } | Error::Phase { .. } => "InternalError",
        }
    }

    /// Check if re-running the failed phase may succeed without a spec change
    ///
    /// Configuration and serialization errors require a fix to the declared
    /// spec. Kubernetes errors are retryable unless they are 4xx responses.
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Configuration { .. } | Error::Serialization { .. } => false,
            Error::NoAddress { .. } => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_carry_cluster_and_field() {
        let err = Error::configuration_for_field("prod", "spec.clusterCIDR", "mask too small");
        assert!(err.to_string().contains("prod"));
        assert!(err.to_string().contains("mask too small"));
        match &err {
            Error::Configuration { field, .. } => {
                assert_eq!(field.as_deref(), Some("spec.clusterCIDR"));
            }
            _ => panic!("Expected Configuration variant"),
        }
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "ConfigurationError");
    }

    #[test]
    fn remote_command_error_reports_exit_and_stderr() {
        let err = Error::remote_command("10.0.0.5", "/opt/hook.sh --pre", 3, "permission denied");
        let msg = err.to_string();
        assert!(msg.contains("10.0.0.5"));
        assert!(msg.contains("exit 3"));
        assert!(msg.contains("permission denied"));
        assert!(err.is_retryable());
    }

    #[test]
    fn phase_wrapping_preserves_root_cause() {
        let err = Error::not_ready("c1", "no client registered").in_phase("EnsureAddons", "c1");
        assert!(err.is_not_ready());
        assert_eq!(err.kind(), "NotReady");
        assert!(err.to_string().contains("EnsureAddons"));

        let err = Error::timeout("node_ready", "never Ready").in_phase("EnsureNodeReady", "h");
        assert!(!err.is_not_ready());
        assert!(matches!(err.root(), Error::Timeout { .. }));
    }

    #[test]
    fn no_address_is_not_retryable() {
        let err = Error::no_address("empty");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn default_context_is_unknown() {
        match Error::configuration("x") {
            Error::Configuration { cluster, .. } => assert_eq!(cluster, UNKNOWN_CONTEXT),
            _ => panic!("Expected Configuration variant"),
        }
        assert!(Error::internal("boom").to_string().contains("[unknown]"));
    }
}
