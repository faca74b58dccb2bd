//! Kubeconfig rendering
//!
//! Documents are built as JSON values and emitted as YAML so they load with
//! `kube::config::Kubeconfig::from_yaml` as well as kubectl.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::json;

use keel_common::{ClusterRecord, Error, KUBE_APISERVER};

use crate::pki::{ADMIN_CERT, ADMIN_KEY};

/// User name of the admin identity
pub const ADMIN_USER: &str = "kubernetes-admin";

/// User name kubelets bootstrap with
pub const BOOTSTRAP_USER: &str = "tls-bootstrap-token-user";

/// How the kubeconfig user authenticates
#[derive(Clone, Copy, Debug)]
pub enum Credentials<'a> {
    /// Client certificate and key PEM
    ClientCert {
        /// Certificate PEM
        cert: &'a str,
        /// Key PEM
        key: &'a str,
    },
    /// Bearer token
    Token(&'a str),
}

/// Render a single-context kubeconfig
pub fn render(
    cluster: &str,
    server: &str,
    ca_pem: &str,
    user: &str,
    credentials: Credentials<'_>,
) -> Result<String, Error> {
    let user_entry = match credentials {
        Credentials::ClientCert { cert, key } => json!({
            "client-certificate-data": STANDARD.encode(cert),
            "client-key-data": STANDARD.encode(key),
        }),
        Credentials::Token(token) => json!({ "token": token }),
    };
    let context = format!("{}@{}", user, cluster);

    let doc = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": cluster,
            "cluster": {
                "server": server,
                "certificate-authority-data": STANDARD.encode(ca_pem),
            },
        }],
        "users": [{ "name": user, "user": user_entry }],
        "contexts": [{
            "name": context,
            "context": { "cluster": cluster, "user": user },
        }],
        "current-context": context,
    });

    serde_yaml::to_string(&doc).map_err(|e| Error::serialization_for_kind("Kubeconfig", e.to_string()))
}

/// Server URL of the first cluster entry
pub fn server_of(kubeconfig: &str) -> Option<String> {
    let doc: serde_yaml::Value = serde_yaml::from_str(kubeconfig).ok()?;
    doc.get("clusters")?
        .get(0)?
        .get("cluster")?
        .get("server")?
        .as_str()
        .map(String::from)
}

/// In-cluster URL of the hosted API server, as the control plane sees it
pub fn in_cluster_server(record: &ClusterRecord) -> String {
    format!("https://{}:{}", KUBE_APISERVER, record.bind_port())
}

fn ca_of(record: &ClusterRecord) -> Result<&str, Error> {
    record
        .credential
        .ca_cert
        .as_deref()
        .ok_or_else(|| Error::configuration_for(record.name(), "cluster CA has not been issued"))
}

/// Admin kubeconfig against `server` using the admin client certificate
pub fn admin(record: &ClusterRecord, server: &str) -> Result<String, Error> {
    let ca = ca_of(record)?;
    let certs = &record.credential.certs;
    let (cert, key) = match (certs.get(ADMIN_CERT), certs.get(ADMIN_KEY)) {
        (Some(cert), Some(key)) => (cert.as_str(), key.as_str()),
        _ => {
            return Err(Error::configuration_for(
                record.name(),
                "admin client certificate has not been issued",
            ))
        }
    };
    render(
        &record.name(),
        server,
        ca,
        ADMIN_USER,
        Credentials::ClientCert { cert, key },
    )
}

/// Node kubeconfig against `server` authenticating with the bootstrap token
pub fn node(record: &ClusterRecord, server: &str) -> Result<String, Error> {
    let ca = ca_of(record)?;
    let token = record.credential.bootstrap_token.as_deref().ok_or_else(|| {
        Error::configuration_for(record.name(), "bootstrap token has not been derived")
    })?;
    render(
        &record.name(),
        server,
        ca,
        BOOTSTRAP_USER,
        Credentials::Token(token),
    )
}

/// Admin kubeconfig against the third-party VIP
pub fn external(record: &ClusterRecord) -> Result<String, Error> {
    let ha = record.spec().features.third_party_ha().ok_or_else(|| {
        Error::configuration_for_field(
            record.name(),
            "spec.features.ha.thirdParty",
            "external kubeconfig requires a third-party VIP",
        )
    })?;
    admin(record, &format!("https://{}:{}", ha.vip, record.bind_port()))
}
