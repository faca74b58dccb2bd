//! API server endpoint selection
//!
//! Advertise addresses (HA fronts) win over Real machine addresses; within
//! the winning set the choice is uniform so no single replica becomes the
//! permanent join target.

use rand::seq::SliceRandom;
use rand::Rng;

use keel_common::crd::{AddressType, ClusterAddress};
use keel_common::{ClusterRecord, Error};

/// Pick an API server address from the cluster's known addresses
pub fn select_address<'a, R: Rng + ?Sized>(
    cluster: &str,
    addresses: &'a [ClusterAddress],
    rng: &mut R,
) -> Result<&'a ClusterAddress, Error> {
    let of_type = |type_: AddressType| -> Vec<&'a ClusterAddress> {
        addresses.iter().filter(|a| a.type_ == type_).collect()
    };

    let advertise = of_type(AddressType::Advertise);
    let candidates = if advertise.is_empty() {
        of_type(AddressType::Real)
    } else {
        advertise
    };

    candidates
        .choose(rng)
        .copied()
        .ok_or_else(|| Error::no_address(cluster))
}

/// `https://host:port` of a selected API server address
pub fn master_endpoint<R: Rng + ?Sized>(
    record: &ClusterRecord,
    rng: &mut R,
) -> Result<String, Error> {
    select_address(&record.name(), record.addresses(), rng).map(ClusterAddress::url)
}

/// Address a machine joins through
///
/// The first public alternative name at the bind port when one is declared,
/// otherwise the selected API server address.
pub fn join_endpoint<R: Rng + ?Sized>(
    record: &ClusterRecord,
    rng: &mut R,
) -> Result<ClusterAddress, Error> {
    if let Some(name) = record
        .spec()
        .public_alternative_names
        .iter()
        .map(|n| n.trim())
        .find(|n| !n.is_empty())
    {
        return Ok(ClusterAddress::new(
            AddressType::Advertise,
            name,
            record.bind_port(),
        ));
    }
    select_address(&record.name(), record.addresses(), rng).cloned()
}
