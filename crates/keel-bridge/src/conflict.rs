//! Conflict detection between bridge networks.
//!
//! Two networks conflict when they would share a bridge device or when their
//! bridge subnets overlap. Checks run against [`NetworkSnapshot`]s so no
//! network lock is held while comparing.

use std::sync::Arc;

use ipnet::Ipv4Net;
use keel_common::{KeelError, KeelResult, NetworkId};

use crate::config::NetworkConfig;
use crate::netutils::overlaps;

/// Point-in-time view of a network, enough to test for conflicts.
#[derive(Debug, Clone)]
pub struct NetworkSnapshot {
    /// Network id.
    pub id: NetworkId,
    /// Configuration the network was created with.
    pub config: Arc<NetworkConfig>,
    /// Bridge device name.
    pub bridge_name: String,
    /// Bridge address, once known.
    pub bridge_ipv4: Option<Ipv4Net>,
}

/// Compare a candidate configuration with every other network's.
///
/// # Errors
///
/// Returns [`KeelError::Forbidden`] naming the first conflicting network.
pub fn check_config_conflicts(
    id: &NetworkId,
    candidate: &NetworkConfig,
    existing: &[NetworkSnapshot],
) -> KeelResult<()> {
    for other in existing.iter().filter(|n| &n.id != id) {
        if candidate.conflicts(&other.config) {
            return Err(KeelError::forbidden(format!(
                "cannot create network {id}: configuration conflicts with network {} (bridge {})",
                other.id, other.bridge_name
            )));
        }
    }
    Ok(())
}

/// Compare a candidate bridge with every other network's bridge.
///
/// Networks whose bridge address is not known yet only take part in the
/// name comparison.
///
/// # Errors
///
/// Returns [`KeelError::Forbidden`] naming the first conflicting network.
pub fn check_network_conflicts(
    id: &NetworkId,
    bridge_name: &str,
    bridge_ipv4: Option<Ipv4Net>,
    existing: &[NetworkSnapshot],
) -> KeelResult<()> {
    for other in existing.iter().filter(|n| &n.id != id) {
        if other.bridge_name == bridge_name {
            return Err(KeelError::forbidden(format!(
                "cannot create network {id}: bridge {bridge_name} is used by network {}",
                other.id
            )));
        }
        if let (Some(ours), Some(theirs)) = (bridge_ipv4, other.bridge_ipv4) {
            if overlaps(&ours, &theirs) {
                return Err(KeelError::forbidden(format!(
                    "cannot create network {id}: subnet {} overlaps {} of network {}",
                    ours.trunc(),
                    theirs.trunc(),
                    other.id
                )));
            }
        }
    }
    Ok(())
}
