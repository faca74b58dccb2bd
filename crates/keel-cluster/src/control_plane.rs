//! Hosted control-plane objects
//!
//! The API server, controller manager and scheduler of a cluster run as
//! Deployments in the cluster's namespace on the management cluster. They
//! share one Secret holding the PKI material, the static token file and the
//! admin kubeconfig.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, PodSpec, PodTemplateSpec,
    Secret, SecretVolumeSource, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;

use keel_common::{
    ClusterRecord, Error, ProviderConfig, DEFAULT_API_PORT, KUBE_APISERVER,
    KUBE_CONTROLLER_MANAGER, KUBE_SCHEDULER, MANAGED_BY_LABEL, MANAGED_BY_VALUE,
};

use crate::pki::{
    APISERVER_CERT, APISERVER_KEY, APISERVER_KUBELET_CLIENT_CERT, APISERVER_KUBELET_CLIENT_KEY,
    FRONT_PROXY_CA_CERT, FRONT_PROXY_CLIENT_CERT, FRONT_PROXY_CLIENT_KEY, SA_KEY, SA_PUB,
};
use crate::store::ManagedObject;

/// Secret shared by the control-plane Deployments
pub const PKI_SECRET: &str = "kube-control-plane-pki";

/// ConfigMap holding the audit policy
pub const AUDIT_POLICY_CONFIG_MAP: &str = "kube-apiserver-audit-policy";

/// Audit policy logging every request at Metadata level
pub const AUDIT_POLICY: &str = "apiVersion: audit.k8s.io/v1\nkind: Policy\nrules:\n- level: Metadata\n";

/// Key of the static token file in [`PKI_SECRET`]
pub const TOKEN_FILE: &str = "token.csv";

/// Key of the admin kubeconfig in [`PKI_SECRET`]
pub const ADMIN_KUBECONFIG: &str = "admin.kubeconfig";

/// Key of the audit policy in [`AUDIT_POLICY_CONFIG_MAP`]
pub const AUDIT_POLICY_FILE: &str = "audit-policy.yaml";

const PKI_DIR: &str = "/etc/kubernetes/pki";
const AUDIT_DIR: &str = "/etc/kubernetes/audit";
const ETCD_CLIENT_PORT: u16 = 2379;

/// Static token file granting `token` the cluster-admin identity
pub fn token_file(token: &str) -> String {
    format!("{},admin,admin,system:masters\n", token)
}

fn labels(component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("component".to_string(), component.to_string()),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
    ])
}

fn metadata(record: &ClusterRecord, name: &str, component: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(record.namespace()),
        labels: Some(labels(component)),
        ..Default::default()
    }
}

fn pki_path(file: &str) -> String {
    format!("{}/{}", PKI_DIR, file)
}

fn image_tag(version: &str) -> String {
    if version.starts_with('v') {
        version.to_string()
    } else {
        format!("v{}", version)
    }
}

/// Derived facts the control plane is configured from
struct Derived {
    version: String,
    service_cidr: String,
    node_cidr_mask_size: u8,
}

fn derived(record: &ClusterRecord) -> Result<Derived, Error> {
    let status = record.status();
    match (status.version, status.service_cidr, status.node_cidr_mask_size) {
        (Some(version), Some(service_cidr), Some(node_cidr_mask_size)) => Ok(Derived {
            version,
            service_cidr,
            node_cidr_mask_size,
        }),
        _ => Err(Error::configuration_for(
            record.name(),
            "cluster state has not been derived",
        )),
    }
}

/// Secret with certificates, keys, the token file and the admin kubeconfig
pub fn pki_secret(record: &ClusterRecord) -> Result<Secret, Error> {
    let name = record.name();
    let credential = &record.credential;
    let (ca_cert, ca_key) = credential
        .ca_pair()
        .ok_or_else(|| Error::configuration_for(&name, "cluster CA has not been issued"))?;
    let token = credential
        .token
        .as_deref()
        .ok_or_else(|| Error::configuration_for(&name, "cluster token has not been derived"))?;

    let mut data: BTreeMap<String, ByteString> = credential
        .certs
        .iter()
        .map(|(file, pem)| (file.clone(), ByteString(pem.clone().into_bytes())))
        .collect();
    data.insert("ca.crt".to_string(), ByteString(ca_cert.as_bytes().to_vec()));
    data.insert("ca.key".to_string(), ByteString(ca_key.as_bytes().to_vec()));
    data.insert(TOKEN_FILE.to_string(), ByteString(token_file(token).into_bytes()));
    if let Some(kubeconfig) = &credential.kubeconfig {
        data.insert(
            ADMIN_KUBECONFIG.to_string(),
            ByteString(kubeconfig.clone().into_bytes()),
        );
    }

    Ok(Secret {
        metadata: metadata(record, PKI_SECRET, KUBE_APISERVER),
        type_: Some("Opaque".to_string()),
        data: Some(data),
        ..Default::default()
    })
}

/// ConfigMap with the audit policy
pub fn audit_policy_config_map(record: &ClusterRecord) -> ConfigMap {
    ConfigMap {
        metadata: metadata(record, AUDIT_POLICY_CONFIG_MAP, KUBE_APISERVER),
        data: Some(BTreeMap::from([(
            AUDIT_POLICY_FILE.to_string(),
            AUDIT_POLICY.to_string(),
        )])),
        ..Default::default()
    }
}

fn pki_volume() -> (Volume, VolumeMount) {
    (
        Volume {
            name: "pki".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(PKI_SECRET.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
        VolumeMount {
            name: "pki".to_string(),
            mount_path: PKI_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        },
    )
}

fn deployment(
    config: &ProviderConfig,
    record: &ClusterRecord,
    component: &str,
    version: &str,
    command: Vec<String>,
    volumes: Vec<(Volume, VolumeMount)>,
    ports: Option<Vec<ContainerPort>>,
) -> Deployment {
    let (volumes, mounts): (Vec<_>, Vec<_>) = volumes.into_iter().unzip();

    Deployment {
        metadata: metadata(record, component, component),
        spec: Some(DeploymentSpec {
            replicas: Some(config.control_plane_replicas),
            selector: LabelSelector {
                match_labels: Some(labels(component)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(component)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    priority_class_name: Some("system-cluster-critical".to_string()),
                    containers: vec![Container {
                        name: component.to_string(),
                        image: Some(config.image(component, &image_tag(version))),
                        command: Some(command),
                        ports,
                        volume_mounts: Some(mounts),
                        ..Default::default()
                    }],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// API server Deployment
pub fn apiserver_deployment(
    config: &ProviderConfig,
    record: &ClusterRecord,
) -> Result<Deployment, Error> {
    let derived = derived(record)?;
    let etcd = format!(
        "https://etcd.{}.svc:{}",
        record.namespace(),
        ETCD_CLIENT_PORT
    );

    let command = vec![
        KUBE_APISERVER.to_string(),
        format!("--secure-port={}", DEFAULT_API_PORT),
        format!("--service-cluster-ip-range={}", derived.service_cidr),
        format!("--etcd-servers={}", etcd),
        format!("--etcd-cafile={}", pki_path("ca.crt")),
        format!("--client-ca-file={}", pki_path("ca.crt")),
        format!("--tls-cert-file={}", pki_path(APISERVER_CERT)),
        format!("--tls-private-key-file={}", pki_path(APISERVER_KEY)),
        format!(
            "--kubelet-client-certificate={}",
            pki_path(APISERVER_KUBELET_CLIENT_CERT)
        ),
        format!(
            "--kubelet-client-key={}",
            pki_path(APISERVER_KUBELET_CLIENT_KEY)
        ),
        format!("--requestheader-client-ca-file={}", pki_path(FRONT_PROXY_CA_CERT)),
        format!("--proxy-client-cert-file={}", pki_path(FRONT_PROXY_CLIENT_CERT)),
        format!("--proxy-client-key-file={}", pki_path(FRONT_PROXY_CLIENT_KEY)),
        "--requestheader-allowed-names=front-proxy-client".to_string(),
        "--requestheader-extra-headers-prefix=X-Remote-Extra-".to_string(),
        "--requestheader-group-headers=X-Remote-Group".to_string(),
        "--requestheader-username-headers=X-Remote-User".to_string(),
        format!("--service-account-key-file={}", pki_path(SA_PUB)),
        format!("--service-account-signing-key-file={}", pki_path(SA_KEY)),
        format!(
            "--service-account-issuer=https://kubernetes.default.svc.{}",
            record.spec().dns_domain
        ),
        format!("--token-auth-file={}", pki_path(TOKEN_FILE)),
        format!("--audit-policy-file={}/{}", AUDIT_DIR, AUDIT_POLICY_FILE),
        "--audit-log-path=-".to_string(),
        "--authorization-mode=Node,RBAC".to_string(),
        "--enable-bootstrap-token-auth=true".to_string(),
        "--allow-privileged=true".to_string(),
    ];

    let audit = (
        Volume {
            name: "audit".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: AUDIT_POLICY_CONFIG_MAP.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        },
        VolumeMount {
            name: "audit".to_string(),
            mount_path: AUDIT_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        },
    );

    Ok(deployment(
        config,
        record,
        KUBE_APISERVER,
        &derived.version,
        command,
        vec![pki_volume(), audit],
        Some(vec![ContainerPort {
            name: Some("https".to_string()),
            container_port: i32::from(DEFAULT_API_PORT),
            ..Default::default()
        }]),
    ))
}

/// Service in front of the API server, exposed on the cluster's bind port
pub fn apiserver_service(record: &ClusterRecord) -> Service {
    Service {
        metadata: metadata(record, KUBE_APISERVER, KUBE_APISERVER),
        spec: Some(ServiceSpec {
            selector: Some(labels(KUBE_APISERVER)),
            ports: Some(vec![ServicePort {
                name: Some("https".to_string()),
                port: i32::from(record.bind_port()),
                target_port: Some(IntOrString::Int(i32::from(DEFAULT_API_PORT))),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Controller manager Deployment
pub fn controller_manager_deployment(
    config: &ProviderConfig,
    record: &ClusterRecord,
) -> Result<Deployment, Error> {
    let derived = derived(record)?;
    let command = vec![
        KUBE_CONTROLLER_MANAGER.to_string(),
        format!("--kubeconfig={}", pki_path(ADMIN_KUBECONFIG)),
        format!("--cluster-name={}", record.name()),
        "--allocate-node-cidrs=true".to_string(),
        format!("--cluster-cidr={}", record.spec().cluster_cidr),
        format!("--node-cidr-mask-size={}", derived.node_cidr_mask_size),
        format!("--service-cluster-ip-range={}", derived.service_cidr),
        format!("--cluster-signing-cert-file={}", pki_path("ca.crt")),
        format!("--cluster-signing-key-file={}", pki_path("ca.key")),
        format!("--root-ca-file={}", pki_path("ca.crt")),
        format!("--service-account-private-key-file={}", pki_path(SA_KEY)),
        "--use-service-account-credentials=true".to_string(),
        "--controllers=*,bootstrapsigner,tokencleaner".to_string(),
        "--leader-elect=true".to_string(),
    ];
    Ok(deployment(
        config,
        record,
        KUBE_CONTROLLER_MANAGER,
        &derived.version,
        command,
        vec![pki_volume()],
        None,
    ))
}

/// Scheduler Deployment
pub fn scheduler_deployment(
    config: &ProviderConfig,
    record: &ClusterRecord,
) -> Result<Deployment, Error> {
    let derived = derived(record)?;
    let command = vec![
        KUBE_SCHEDULER.to_string(),
        format!("--kubeconfig={}", pki_path(ADMIN_KUBECONFIG)),
        "--leader-elect=true".to_string(),
    ];
    Ok(deployment(
        config,
        record,
        KUBE_SCHEDULER,
        &derived.version,
        command,
        vec![pki_volume()],
        None,
    ))
}

/// Every control-plane object, in reconcile order
///
/// Shared configuration first, then the API server ahead of the controller
/// manager and scheduler that talk to it.
pub fn control_plane_objects(
    config: &ProviderConfig,
    record: &ClusterRecord,
) -> Result<Vec<ManagedObject>, Error> {
    Ok(vec![
        ManagedObject::Secret(pki_secret(record)?),
        ManagedObject::ConfigMap(audit_policy_config_map(record)),
        ManagedObject::Deployment(apiserver_deployment(config, record)?),
        ManagedObject::Service(apiserver_service(record)),
        ManagedObject::Deployment(controller_manager_deployment(config, record)?),
        ManagedObject::Deployment(scheduler_deployment(config, record)?),
    ])
}

#[cfg(test)]
mod tests {
    use keel_common::crd::{Cluster, ClusterSpec, HaSpec, ThirdPartyHa};

    use super::*;

    fn derived_record() -> ClusterRecord {
        let mut record = ClusterRecord::new(Cluster::new(
            "c1",
            ClusterSpec {
                version: "1.32.0".to_string(),
                cluster_cidr: "10.0.0.0/16".to_string(),
                service_cidr: None,
                dns_domain: "cluster.local".to_string(),
                properties: Default::default(),
                machines: Vec::new(),
                features: Default::default(),
                public_alternative_names: Vec::new(),
                tenant_id: None,
            },
        ));
        let status = record.status_mut();
        status.version = Some("1.32.0".to_string());
        status.service_cidr = Some("10.0.240.0/20".to_string());
        status.node_cidr_mask_size = Some(24);
        status.dns_ip = Some("10.0.240.10".to_string());
        record.credential.token = Some("0190a5c4-token".to_string());
        record.credential.ca_cert = Some("ca-pem".to_string());
        record.credential.ca_key = Some("ca-key-pem".to_string());
        record
            .credential
            .certs
            .insert(APISERVER_CERT.to_string(), "apiserver-pem".to_string());
        record.credential.kubeconfig = Some("apiVersion: v1".to_string());
        record
    }

    fn command(d: &Deployment) -> Vec<String> {
        d.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
            .command
            .clone()
            .unwrap()
    }

    #[test]
    fn token_file_grants_system_masters() {
        assert_eq!(token_file("abc"), "abc,admin,admin,system:masters\n");
    }

    #[test]
    fn secret_carries_token_file_certs_and_kubeconfig() {
        let secret = pki_secret(&derived_record()).unwrap();
        let data = secret.data.unwrap();
        assert_eq!(
            data[TOKEN_FILE].0,
            b"0190a5c4-token,admin,admin,system:masters\n".to_vec()
        );
        assert_eq!(data["ca.crt"].0, b"ca-pem".to_vec());
        assert_eq!(data[APISERVER_CERT].0, b"apiserver-pem".to_vec());
        assert!(data.contains_key(ADMIN_KUBECONFIG));
        assert_eq!(secret.metadata.namespace.as_deref(), Some("c1"));
    }

    #[test]
    fn secret_requires_ca() {
        let mut record = derived_record();
        record.credential.ca_key = None;
        assert!(matches!(
            pki_secret(&record).unwrap_err(),
            Error::Configuration { .. }
        ));
    }

    #[test]
    fn audit_policy_is_metadata_level() {
        let cm = audit_policy_config_map(&derived_record());
        let policy = &cm.data.unwrap()[AUDIT_POLICY_FILE];
        assert!(policy.starts_with("apiVersion: audit.k8s.io/v1\nkind: Policy\n"));
        assert!(policy.contains("- level: Metadata"));
    }

    #[test]
    fn apiserver_uses_derived_service_range_and_registry_image() {
        let mut config = ProviderConfig::default();
        config.registry.domain = "registry.example.com".to_string();
        config.control_plane_replicas = 3;

        let d = apiserver_deployment(&config, &derived_record()).unwrap();
        let spec = d.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(3));
        let container = &spec.template.spec.as_ref().unwrap().containers[0];
        assert_eq!(
            container.image.as_deref(),
            Some("registry.example.com/library/kube-apiserver:v1.32.0")
        );
        assert!(command(&d).contains(&"--service-cluster-ip-range=10.0.240.0/20".to_string()));
    }

    #[test]
    fn controller_manager_allocates_node_cidrs() {
        let d = controller_manager_deployment(&ProviderConfig::default(), &derived_record())
            .unwrap();
        let cmd = command(&d);
        assert!(cmd.contains(&"--cluster-cidr=10.0.0.0/16".to_string()));
        assert!(cmd.contains(&"--node-cidr-mask-size=24".to_string()));
    }

    #[test]
    fn service_listens_on_bind_port() {
        let mut record = derived_record();
        record.cluster.spec.features.ha = Some(HaSpec {
            self_managed: None,
            third_party: Some(ThirdPartyHa {
                vip: "10.1.1.1".to_string(),
                vport: 16443,
            }),
        });
        let svc = apiserver_service(&record);
        let port = &svc.spec.unwrap().ports.unwrap()[0];
        assert_eq!(port.port, 16443);
        assert_eq!(port.target_port, Some(IntOrString::Int(6443)));
    }

    #[test]
    fn objects_come_in_dependency_order() {
        let objects = control_plane_objects(&ProviderConfig::default(), &derived_record()).unwrap();
        let names: Vec<_> = objects.iter().map(|o| o.name().to_string()).collect();
        assert_eq!(
            names,
            vec![
                PKI_SECRET,
                AUDIT_POLICY_CONFIG_MAP,
                KUBE_APISERVER,
                KUBE_APISERVER,
                KUBE_CONTROLLER_MANAGER,
                KUBE_SCHEDULER,
            ]
        );
    }

    #[test]
    fn underived_record_is_rejected() {
        let mut record = derived_record();
        record.cluster.status = None;
        assert!(control_plane_objects(&ProviderConfig::default(), &record).is_err());
    }
}
