//! Cluster certificate material
//!
//! Issues the certificate set a hosted control plane needs: the cluster CA,
//! the front-proxy CA, serving and client certificates for the API server,
//! the service-account signing key and the admin client certificate.
//!
//! Material is kept across runs. A missing, unparseable or expired CA
//! replaces the whole set, as does a forced regeneration. Under a reused CA
//! only the leaves that are missing, expired, due for rotation or (for the
//! API server) issued for a different set of names are reissued.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr};

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use thiserror::Error;
use tracing::{debug, info};
use x509_parser::prelude::*;

use keel_common::network::{indexed_ip, Ipv4Cidr};
use keel_common::{ClusterRecord, Error, API_SERVICE_IP_INDEX, KUBE_APISERVER};

/// Validity period for CA certificates (10 years)
pub const CA_VALIDITY_YEARS: i64 = 10;

/// Validity period for leaf certificates (1 year)
pub const CERT_VALIDITY_YEARS: i64 = 1;

/// Fraction of a certificate's lifetime after which it is reissued
pub const ROTATION_THRESHOLD: f64 = 0.80;

/// Organization of the admin client certificate
pub const ADMIN_ORGANIZATION: &str = "system:masters";

/// API server serving certificate
pub const APISERVER_CERT: &str = "apiserver.crt";
/// API server serving key
pub const APISERVER_KEY: &str = "apiserver.key";
/// Client certificate the API server presents to kubelets
pub const APISERVER_KUBELET_CLIENT_CERT: &str = "apiserver-kubelet-client.crt";
/// Key for [`APISERVER_KUBELET_CLIENT_CERT`]
pub const APISERVER_KUBELET_CLIENT_KEY: &str = "apiserver-kubelet-client.key";
/// Front-proxy CA certificate
pub const FRONT_PROXY_CA_CERT: &str = "front-proxy-ca.crt";
/// Front-proxy CA key
pub const FRONT_PROXY_CA_KEY: &str = "front-proxy-ca.key";
/// Front-proxy client certificate
pub const FRONT_PROXY_CLIENT_CERT: &str = "front-proxy-client.crt";
/// Front-proxy client key
pub const FRONT_PROXY_CLIENT_KEY: &str = "front-proxy-client.key";
/// Service-account signing key
pub const SA_KEY: &str = "sa.key";
/// Service-account verification key
pub const SA_PUB: &str = "sa.pub";
/// Admin client certificate
pub const ADMIN_CERT: &str = "admin.crt";
/// Admin client key
pub const ADMIN_KEY: &str = "admin.key";

/// Every entry [`ensure_certificates`] writes into `ClusterCredential::certs`
pub const CERT_FILES: &[&str] = &[
    APISERVER_CERT,
    APISERVER_KEY,
    APISERVER_KUBELET_CLIENT_CERT,
    APISERVER_KUBELET_CLIENT_KEY,
    FRONT_PROXY_CA_CERT,
    FRONT_PROXY_CA_KEY,
    FRONT_PROXY_CLIENT_CERT,
    FRONT_PROXY_CLIENT_KEY,
    SA_KEY,
    SA_PUB,
    ADMIN_CERT,
    ADMIN_KEY,
];

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate or key parsing failed
    #[error("certificate parsing error: {0}")]
    ParseError(String),
}

impl From<PkiError> for Error {
    fn from(e: PkiError) -> Self {
        Error::crypto(e.to_string())
    }
}

/// Certificate validity window from now
fn compute_validity(years: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    (now, now + ::time::Duration::days(years * 365))
}

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>, PkiError> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// Validity of a parsed certificate
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    /// When the certificate becomes valid (Unix timestamp)
    pub not_before: i64,
    /// When the certificate expires (Unix timestamp)
    pub not_after: i64,
    /// Subject common name
    pub common_name: String,
    /// DNS and IP subject alternative names
    pub alt_names: BTreeSet<String>,
}

impl CertificateInfo {
    /// Parse certificate info from a PEM-encoded certificate
    pub fn from_pem(pem_data: &str) -> Result<Self, PkiError> {
        let der = parse_pem(pem_data)?;
        let (_, cert) = X509Certificate::from_der(&der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();

        let mut alt_names = BTreeSet::new();
        let san = cert
            .subject_alternative_name()
            .map_err(|e| PkiError::ParseError(format!("invalid subject alternative names: {}", e)))?;
        if let Some(san) = san {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => {
                        alt_names.insert(dns.to_string());
                    }
                    GeneralName::IPAddress(raw) => {
                        if let Some(ip) = ip_from_bytes(raw) {
                            alt_names.insert(ip.to_string());
                        }
                    }
                    _ => {}
                }
            }
        }

        Ok(Self {
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            common_name,
            alt_names,
        })
    }

    fn now() -> i64 {
        ::time::OffsetDateTime::now_utc().unix_timestamp()
    }

    /// Check if the certificate has expired
    pub fn is_expired(&self) -> bool {
        self.not_after <= Self::now()
    }

    /// Check if the certificate is past [`ROTATION_THRESHOLD`] of its lifetime
    pub fn needs_rotation(&self) -> bool {
        let lifetime = (self.not_after - self.not_before) as f64;
        if lifetime <= 0.0 {
            return true;
        }
        (Self::now() - self.not_before) as f64 / lifetime >= ROTATION_THRESHOLD
    }
}

fn ip_from_bytes(raw: &[u8]) -> Option<IpAddr> {
    match raw.len() {
        4 => <[u8; 4]>::try_from(raw).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(raw).ok().map(IpAddr::from),
        _ => None,
    }
}

/// What a leaf certificate is used for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Usage {
    Server,
    Client,
}

fn distinguished_name(common_name: &str, organization: Option<&str>) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    if let Some(org) = organization {
        dn.push(DnType::OrganizationName, DnValue::Utf8String(org.to_string()));
    }
    dn
}

fn san_entries(sans: &[String]) -> Result<Vec<SanType>, PkiError> {
    sans.iter()
        .map(|san| {
            if let Ok(ip) = san.parse::<IpAddr>() {
                Ok(SanType::IpAddress(ip))
            } else {
                Ia5String::try_from(san.clone())
                    .map(SanType::DnsName)
                    .map_err(|e| {
                        PkiError::CertificateGenerationFailed(format!(
                            "invalid DNS name '{}': {}",
                            san, e
                        ))
                    })
            }
        })
        .collect()
}

fn generate_key(what: &str) -> Result<KeyPair, PkiError> {
    KeyPair::generate()
        .map_err(|e| PkiError::KeyGenerationFailed(format!("failed to generate {} key: {}", what, e)))
}

/// A signing CA held as PEM
#[derive(Clone)]
pub struct CertificateAuthority {
    cert_pem: String,
    key_pem: String,
}

impl CertificateAuthority {
    /// Create a new self-signed CA
    pub fn new(common_name: &str) -> Result<Self, PkiError> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name, None);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let (not_before, not_after) = compute_validity(CA_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        let key = generate_key("CA")?;
        let cert = params.self_signed(&key).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }

    /// Load a CA from PEM, rejecting material that does not parse or has expired
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, PkiError> {
        KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA key: {}", e)))?;
        let info = CertificateInfo::from_pem(cert_pem)?;
        if info.is_expired() {
            return Err(PkiError::ParseError(format!(
                "CA {} has expired",
                info.common_name
            )));
        }
        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
        })
    }

    /// CA certificate PEM
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// CA private key PEM
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Issue a leaf certificate, returning `(cert_pem, key_pem)`
    fn issue(
        &self,
        common_name: &str,
        organization: Option<&str>,
        sans: &[String],
        usage: Usage,
    ) -> Result<(String, String), PkiError> {
        let validity = compute_validity(CERT_VALIDITY_YEARS);
        self.issue_valid_for(common_name, organization, sans, usage, validity)
    }

    fn issue_valid_for(
        &self,
        common_name: &str,
        organization: Option<&str>,
        sans: &[String],
        usage: Usage,
        (not_before, not_after): (::time::OffsetDateTime, ::time::OffsetDateTime),
    ) -> Result<(String, String), PkiError> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name, organization);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = match usage {
            Usage::Server => vec![ExtendedKeyUsagePurpose::ServerAuth],
            Usage::Client => vec![ExtendedKeyUsagePurpose::ClientAuth],
        };
        params.not_before = not_before;
        params.not_after = not_after;
        params.subject_alt_names = san_entries(sans)?;

        let key = generate_key(common_name)?;
        let ca_key = KeyPair::from_pem(&self.key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))?;
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;
        let cert = params.signed_by(&key, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!(
                "failed to sign {} cert: {}",
                common_name, e
            ))
        })?;

        Ok((cert.pem(), key.serialize_pem()))
    }
}

/// Subject alternative names of the API server serving certificate
///
/// Covers the in-cluster service names, every known address, the declared
/// alternative names and the first service IP.
pub fn apiserver_sans(record: &ClusterRecord, service_ip: Ipv4Addr) -> Vec<String> {
    let namespace = record.namespace();
    let dns_domain = &record.spec().dns_domain;

    let mut sans = vec![
        KUBE_APISERVER.to_string(),
        format!("{}.{}", KUBE_APISERVER, namespace),
        format!("{}.{}.svc", KUBE_APISERVER, namespace),
        "kubernetes".to_string(),
        "kubernetes.default".to_string(),
        "kubernetes.default.svc".to_string(),
        format!("kubernetes.default.svc.{}", dns_domain),
    ];
    sans.extend(record.addresses().iter().map(|a| a.host.clone()));
    sans.extend(
        record
            .spec()
            .public_alternative_names
            .iter()
            .map(|n| n.trim())
            .filter(|n| !n.is_empty())
            .map(String::from),
    );
    sans.push(service_ip.to_string());
    sans.push("127.0.0.1".to_string());
    sans.push("localhost".to_string());

    let mut seen = std::collections::HashSet::new();
    sans.retain(|s| seen.insert(s.clone()));
    sans
}

/// The cluster CA, when the stored material is valid for reuse
fn reusable_ca(record: &ClusterRecord) -> Option<CertificateAuthority> {
    let (cert, key) = record.credential.ca_pair()?;
    match CertificateAuthority::from_pem(cert, key) {
        Ok(ca) => Some(ca),
        Err(e) => {
            debug!(cluster = %record.name(), error = %e, "stored CA is not reusable");
            None
        }
    }
}

/// Address the API server is reachable at inside the service network
fn apiserver_service_ip(record: &ClusterRecord) -> Result<Ipv4Addr, Error> {
    let name = record.name();
    let service_cidr = record.status().service_cidr.ok_or_else(|| {
        Error::configuration_for_field(&name, "status.serviceCIDR", "service CIDR not derived")
    })?;
    let service_cidr: Ipv4Cidr = service_cidr
        .parse()
        .map_err(|e| Error::configuration_for_field(&name, "status.serviceCIDR", format!("{}", e)))?;
    indexed_ip(&service_cidr, API_SERVICE_IP_INDEX)
        .map_err(|e| Error::configuration_for_field(&name, "status.serviceCIDR", format!("{}", e)))
}

fn normalized_names(sans: &[String]) -> BTreeSet<String> {
    sans.iter()
        .map(|s| match s.parse::<IpAddr>() {
            Ok(ip) => ip.to_string(),
            Err(_) => s.clone(),
        })
        .collect()
}

/// Whether a stored leaf pair can be kept
///
/// `names` additionally requires the certificate's alternative names to
/// match exactly.
fn leaf_is_current(
    certs: &BTreeMap<String, String>,
    cert_file: &str,
    key_file: &str,
    names: Option<&BTreeSet<String>>,
) -> bool {
    let (Some(cert), Some(key)) = (certs.get(cert_file), certs.get(key_file)) else {
        return false;
    };
    if KeyPair::from_pem(key).is_err() {
        debug!(cert = cert_file, "stored key does not parse");
        return false;
    }
    let info = match CertificateInfo::from_pem(cert) {
        Ok(info) => info,
        Err(e) => {
            debug!(cert = cert_file, error = %e, "stored certificate does not parse");
            return false;
        }
    };
    if info.is_expired() || info.needs_rotation() {
        debug!(
            cert = cert_file,
            not_after = info.not_after,
            "stored certificate is due for rotation"
        );
        return false;
    }
    match names {
        Some(names) if *names != info.alt_names => {
            debug!(cert = cert_file, "stored certificate names drifted");
            false
        }
        _ => true,
    }
}

fn put(
    certs: &mut BTreeMap<String, String>,
    cert_file: &str,
    key_file: &str,
    (cert, key): (String, String),
) {
    certs.insert(cert_file.to_string(), cert);
    certs.insert(key_file.to_string(), key);
}

/// Issue the cluster's certificate set
///
/// Returns `Ok(false)` when existing material was kept and `Ok(true)` when
/// any certificate was (re)issued. A valid CA is reused and only stale
/// leaves are replaced; `force` replaces everything including the CA.
pub fn ensure_certificates(record: &mut ClusterRecord, force: bool) -> Result<bool, Error> {
    let name = record.name();
    let service_ip = apiserver_service_ip(record)?;
    let sans = apiserver_sans(record, service_ip);
    let names = normalized_names(&sans);

    let reused_ca = if force { None } else { reusable_ca(record) };
    let (ca, mut certs) = match reused_ca {
        Some(ca) => (ca, record.credential.certs.clone()),
        None => (CertificateAuthority::new("kubernetes")?, BTreeMap::new()),
    };
    let mut reissued = Vec::new();

    if !leaf_is_current(&certs, APISERVER_CERT, APISERVER_KEY, Some(&names)) {
        let pair = ca.issue(KUBE_APISERVER, None, &sans, Usage::Server)?;
        put(&mut certs, APISERVER_CERT, APISERVER_KEY, pair);
        reissued.push(APISERVER_CERT);
    }
    let kubelet_client = (APISERVER_KUBELET_CLIENT_CERT, APISERVER_KUBELET_CLIENT_KEY);
    if !leaf_is_current(&certs, kubelet_client.0, kubelet_client.1, None) {
        let pair = ca.issue(
            "kube-apiserver-kubelet-client",
            Some(ADMIN_ORGANIZATION),
            &[],
            Usage::Client,
        )?;
        put(&mut certs, kubelet_client.0, kubelet_client.1, pair);
        reissued.push(APISERVER_KUBELET_CLIENT_CERT);
    }

    let stored_front_proxy_ca = certs
        .get(FRONT_PROXY_CA_CERT)
        .zip(certs.get(FRONT_PROXY_CA_KEY))
        .and_then(|(cert, key)| CertificateAuthority::from_pem(cert, key).ok());
    let front_proxy_ca = match stored_front_proxy_ca {
        Some(ca) => ca,
        None => {
            let ca = CertificateAuthority::new("front-proxy-ca")?;
            let pair = (ca.cert_pem().to_string(), ca.key_pem().to_string());
            put(&mut certs, FRONT_PROXY_CA_CERT, FRONT_PROXY_CA_KEY, pair);
            reissued.push(FRONT_PROXY_CA_CERT);
            ca
        }
    };
    let front_proxy_ca_replaced = reissued.contains(&FRONT_PROXY_CA_CERT);
    if front_proxy_ca_replaced
        || !leaf_is_current(&certs, FRONT_PROXY_CLIENT_CERT, FRONT_PROXY_CLIENT_KEY, None)
    {
        let pair = front_proxy_ca.issue("front-proxy-client", None, &[], Usage::Client)?;
        put(&mut certs, FRONT_PROXY_CLIENT_CERT, FRONT_PROXY_CLIENT_KEY, pair);
        reissued.push(FRONT_PROXY_CLIENT_CERT);
    }

    if !leaf_is_current(&certs, ADMIN_CERT, ADMIN_KEY, None) {
        let pair = ca.issue("kubernetes-admin", Some(ADMIN_ORGANIZATION), &[], Usage::Client)?;
        put(&mut certs, ADMIN_CERT, ADMIN_KEY, pair);
        reissued.push(ADMIN_CERT);
    }

    let sa_valid = certs.contains_key(SA_PUB)
        && certs.get(SA_KEY).is_some_and(|key| KeyPair::from_pem(key).is_ok());
    if !sa_valid {
        let sa = generate_key("service-account")?;
        certs.insert(SA_KEY.to_string(), sa.serialize_pem());
        certs.insert(SA_PUB.to_string(), sa.public_key_pem());
        reissued.push(SA_KEY);
    }

    if reissued.is_empty() {
        debug!(cluster = %name, "certificates already issued");
        return Ok(false);
    }

    record.credential.ca_cert = Some(ca.cert_pem().to_string());
    record.credential.ca_key = Some(ca.key_pem().to_string());
    record.credential.certs = certs;

    info!(cluster = %name, force, reissued = ?reissued, "issued cluster certificates");
    Ok(true)
}
