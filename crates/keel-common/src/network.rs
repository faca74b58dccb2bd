//! IPv4 CIDR arithmetic for cluster networking
//!
//! Sizes the service range and per-node pod ranges from declared capacity.
//! The service range is carved from the tail of the cluster CIDR.

use std::net::Ipv4Addr;
use std::str::FromStr;

use thiserror::Error;

/// CIDR arithmetic failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetworkError {
    /// The string is not an IPv4 CIDR
    #[error("invalid IPv4 CIDR {0:?}")]
    InvalidCidr(String),

    /// A capacity input was zero
    #[error("{0} must be greater than 0")]
    ZeroCapacity(&'static str),

    /// The CIDR cannot hold the requested capacity
    #[error("{cidr} is too small for {what} {requested}")]
    InsufficientSpace {
        /// The CIDR that is too small
        cidr: String,
        /// Which capacity could not be satisfied
        what: &'static str,
        /// The requested amount
        requested: u64,
    },
}

/// An IPv4 network in CIDR notation, normalized to its network address
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ipv4Cidr {
    network: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Cidr {
    /// Create a CIDR, masking off host bits
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, NetworkError> {
        if prefix > 32 {
            return Err(NetworkError::InvalidCidr(format!("{}/{}", addr, prefix)));
        }
        let network = Ipv4Addr::from(u32::from(addr) & mask(prefix));
        Ok(Self { network, prefix })
    }

    /// Network address
    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    /// Prefix length
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Number of addresses in the range
    pub fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix))
    }

    /// Whether the address falls inside the range
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & mask(self.prefix) == u32::from(self.network)
    }

    /// The address at `index` from the network address
    pub fn nth(&self, index: u64) -> Option<Ipv4Addr> {
        if index >= self.size() {
            return None;
        }
        // size() <= 2^32, so index fits in u32 here
        Some(Ipv4Addr::from(u32::from(self.network) + index as u32))
    }
}

impl FromStr for Ipv4Cidr {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || NetworkError::InvalidCidr(s.to_string());
        let (addr, prefix) = s.trim().split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        Self::new(addr, prefix).map_err(|_| invalid())
    }
}

impl std::fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

fn mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

/// Smallest number of host bits holding `n` addresses
fn host_bits(n: u32) -> u8 {
    if n <= 1 {
        0
    } else {
        (32 - (n - 1).leading_zeros()) as u8
    }
}

/// Prefix length of each node's pod range holding at least `max_node_pod_num` pods
pub fn node_cidr_mask_size(
    cluster_cidr: &Ipv4Cidr,
    max_node_pod_num: u32,
) -> Result<u8, NetworkError> {
    if max_node_pod_num == 0 {
        return Err(NetworkError::ZeroCapacity("maxNodePodNum"));
    }
    let node_mask = 32 - host_bits(max_node_pod_num);
    if cluster_cidr.prefix() > node_mask {
        return Err(NetworkError::InsufficientSpace {
            cidr: cluster_cidr.to_string(),
            what: "pods per node",
            requested: u64::from(max_node_pod_num),
        });
    }
    Ok(node_mask)
}

/// Service range and node mask size derived from the cluster CIDR
///
/// The service range is the last block of the cluster CIDR large enough for
/// `max_cluster_service_num` addresses; it must be strictly smaller than the
/// cluster CIDR so pods keep address space.
pub fn service_cidr_and_node_mask_size(
    cluster_cidr: &Ipv4Cidr,
    max_cluster_service_num: u32,
    max_node_pod_num: u32,
) -> Result<(Ipv4Cidr, u8), NetworkError> {
    if max_cluster_service_num == 0 {
        return Err(NetworkError::ZeroCapacity("maxClusterServiceNum"));
    }
    if max_node_pod_num == 0 {
        return Err(NetworkError::ZeroCapacity("maxNodePodNum"));
    }

    let service_mask = 32 - host_bits(max_cluster_service_num);
    if cluster_cidr.prefix() >= service_mask {
        return Err(NetworkError::InsufficientSpace {
            cidr: cluster_cidr.to_string(),
            what: "services",
            requested: u64::from(max_cluster_service_num),
        });
    }

    let last = cluster_cidr
        .nth(cluster_cidr.size() - 1)
        .ok_or_else(|| NetworkError::InvalidCidr(cluster_cidr.to_string()))?;
    let service_cidr = Ipv4Cidr::new(last, service_mask)?;
    let node_mask = node_cidr_mask_size(cluster_cidr, max_node_pod_num)?;

    Ok((service_cidr, node_mask))
}

/// The address at `index` inside `cidr`
pub fn indexed_ip(cidr: &Ipv4Cidr, index: u32) -> Result<Ipv4Addr, NetworkError> {
    cidr.nth(u64::from(index))
        .ok_or_else(|| NetworkError::InsufficientSpace {
            cidr: cidr.to_string(),
            what: "address index",
            requested: u64::from(index),
        })
}
