//! State derivation
//!
//! Computes the facts every later phase reads (version, service CIDR, node
//! mask size, DNS address, API server addresses, tokens) from the declared
//! spec alone. The record is only changed when every step succeeds.

use tracing::{info, warn};

use keel_common::crd::{AddressType, ClusterPhase};
use keel_common::network::{
    indexed_ip, node_cidr_mask_size, service_cidr_and_node_mask_size, Ipv4Cidr, NetworkError,
};
use keel_common::{ClusterRecord, Error, DEFAULT_API_PORT, DNS_IP_INDEX};

use crate::ids::IdGenerator;

fn network_error(cluster: &str, field: &str, e: NetworkError) -> Error {
    Error::configuration_for_field(cluster, field, e.to_string())
}

fn derive_version(record: &mut ClusterRecord) {
    let version = record.spec().version.clone();
    record.status_mut().version = Some(version);
}

fn derive_networking(record: &mut ClusterRecord) -> Result<(), Error> {
    let name = record.name();
    let spec = record.spec();
    let props = &spec.properties;

    let cluster_cidr: Ipv4Cidr = spec
        .cluster_cidr
        .parse()
        .map_err(|e| network_error(&name, "spec.clusterCIDR", e))?;

    let (service_cidr, mask) = match spec.service_cidr.as_deref() {
        Some(declared) => {
            let service_cidr: Ipv4Cidr = declared
                .parse()
                .map_err(|e| network_error(&name, "spec.serviceCIDR", e))?;
            let mask = node_cidr_mask_size(&cluster_cidr, props.max_node_pod_num)
                .map_err(|e| network_error(&name, "spec.properties.maxNodePodNum", e))?;
            (service_cidr, mask)
        }
        None => service_cidr_and_node_mask_size(
            &cluster_cidr,
            props.max_cluster_service_num,
            props.max_node_pod_num,
        )
        .map_err(|e| network_error(&name, "spec.clusterCIDR", e))?,
    };

    let status = record.status_mut();
    status.service_cidr = Some(service_cidr.to_string());
    status.node_cidr_mask_size = Some(mask);
    Ok(())
}

fn derive_dns_ip(record: &mut ClusterRecord) -> Result<(), Error> {
    let name = record.name();
    let service_cidr: Ipv4Cidr = record
        .status()
        .service_cidr
        .unwrap_or_default()
        .parse()
        .map_err(|e| network_error(&name, "status.serviceCIDR", e))?;
    let dns_ip = indexed_ip(&service_cidr, DNS_IP_INDEX)
        .map_err(|e| network_error(&name, "status.serviceCIDR", e))?;
    record.status_mut().dns_ip = Some(dns_ip.to_string());
    Ok(())
}

fn derive_addresses(record: &mut ClusterRecord) {
    let machines: Vec<String> = record.spec().machines.iter().map(|m| m.ip.clone()).collect();
    let ha = record.spec().features.ha.clone();

    record.status_mut().addresses.clear();
    for ip in machines {
        record.add_address(AddressType::Real, ip, DEFAULT_API_PORT);
    }
    if let Some(ha) = ha {
        if let Some(self_managed) = ha.self_managed {
            record.add_address(AddressType::Advertise, self_managed.vip, DEFAULT_API_PORT);
        }
        if let Some(third_party) = ha.third_party {
            record.add_address(AddressType::Advertise, third_party.vip, third_party.vport);
        }
    }
}

fn derive_credentials(record: &mut ClusterRecord, ids: &dyn IdGenerator) -> Result<(), Error> {
    let credential = &mut record.credential;
    if credential.token.is_none() {
        credential.token = Some(ids.cluster_token()?);
    }
    if credential.bootstrap_token.is_none() {
        credential.bootstrap_token = Some(ids.bootstrap_token()?);
    }
    if credential.certificate_key.is_none() {
        credential.certificate_key = Some(ids.certificate_key()?);
    }
    Ok(())
}

/// Derive version, networking, DNS address, addresses and credentials
///
/// Steps run in that order on a draft; the record is replaced only when all
/// of them succeed. Credentials already present are never replaced.
pub fn derive_cluster_state(record: &mut ClusterRecord, ids: &dyn IdGenerator) -> Result<(), Error> {
    let name = record.name();
    let mut draft = record.clone();

    derive_version(&mut draft);
    derive_networking(&mut draft)?;
    derive_dns_ip(&mut draft)?;
    derive_addresses(&mut draft);
    derive_credentials(&mut draft, ids)?;

    let status = draft.status_mut();
    if status.phase == ClusterPhase::Initializing {
        status.phase = ClusterPhase::Provisioning;
    }

    info!(
        cluster = %name,
        service_cidr = status.service_cidr.as_deref().unwrap_or_default(),
        node_mask = status.node_cidr_mask_size.unwrap_or_default(),
        addresses = status.addresses.len(),
        "derived cluster state"
    );
    *record = draft;
    Ok(())
}

/// Replace the cluster token, bootstrap token and certificate key
///
/// Changes the cluster's identity; nodes joined with the old bootstrap token
/// keep working but new joins need the new one.
pub fn regenerate_credentials(record: &mut ClusterRecord, ids: &dyn IdGenerator) -> Result<(), Error> {
    let token = ids.cluster_token()?;
    let bootstrap_token = ids.bootstrap_token()?;
    let certificate_key = ids.certificate_key()?;

    let credential = &mut record.credential;
    credential.token = Some(token);
    credential.bootstrap_token = Some(bootstrap_token);
    credential.certificate_key = Some(certificate_key);

    warn!(cluster = %record.name(), "regenerated cluster credentials");
    Ok(())
}
