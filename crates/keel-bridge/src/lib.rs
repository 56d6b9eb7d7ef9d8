//! # keel-bridge
//!
//! Bridge network driver for Keel.
//!
//! This crate provides:
//! - The [`Driver`] control plane: networks, endpoints, join and leave
//! - The ordered bridge setup pipeline and its cleanup
//! - Conflict detection between networks
//! - Address allocation, port mapping and packet filter rules
//! - Host provisioning through `ip(8)`, `iptables(8)` and procfs, behind
//!   the [`Provisioner`] trait
//!
//! ```no_run
//! use keel_bridge::{Collaborators, Driver, EndpointInfo};
//! use keel_common::{EndpointId, NetworkId, Options};
//!
//! # fn main() -> keel_common::KeelResult<()> {
//! let driver = Driver::new(Collaborators::host());
//! let net = NetworkId::new("net1")?;
//! driver.create_network(&net, &Options::new())?;
//!
//! let mut info = EndpointInfo::new();
//! driver.create_endpoint(&net, &EndpointId::new("ep1")?, &mut info, &Options::new())?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod conflict;
pub mod driver;
pub mod endpoint;
pub mod fake;
pub mod host;
pub mod interface;
pub mod ipam;
pub mod link;
pub mod netns;
pub mod network;
pub mod netutils;
pub mod policy;
pub mod portmap;
pub mod provision;
pub mod registry;
pub mod setup;
pub mod steps;

pub use config::{ContainerConfig, DriverConfig, EndpointConfig, NetworkConfig};
pub use conflict::NetworkSnapshot;
pub use driver::{Collaborators, Driver, NETWORK_TYPE};
pub use endpoint::{
    BridgeEndpoint, EndpointInfo, EndpointOperInfo, InterfaceInfo, InterfaceNames, JoinInfo,
};
pub use host::HostProvisioner;
pub use interface::BridgeInterface;
pub use ipam::{AddressSpace, IpAllocator};
pub use netns::{CurrentNamespace, HostNamespace, OsContext};
pub use network::BridgeNetwork;
pub use netutils::MacAddr;
pub use portmap::{IptablesPortMapper, PortBinding, PortMapper, Protocol, TransportPort};
pub use provision::Provisioner;
