//! Host network provisioning contract.
//!
//! Everything the driver does to the host goes through [`Provisioner`]:
//! links, addresses, sysctls and packet filter rule sets. Implementations
//! report a missing interface as [`KeelError::LinkNotFound`] and an
//! existing one as [`KeelError::LinkExists`] so callers can tell those
//! apart from real failures. Operations that find the host already in the
//! requested state succeed.
//!
//! [`KeelError::LinkNotFound`]: keel_common::KeelError::LinkNotFound
//! [`KeelError::LinkExists`]: keel_common::KeelError::LinkExists

use std::net::IpAddr;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use keel_common::KeelResult;

use crate::netutils::MacAddr;
use crate::portmap::TransportPort;

/// Addresses configured on a link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkAddresses {
    /// IPv4 addresses with their prefix.
    pub v4: Vec<Ipv4Net>,
    /// IPv6 addresses with their prefix.
    pub v6: Vec<Ipv6Net>,
}

/// Forwarding allowed from a parent endpoint to a child endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkRule {
    /// Address of the endpoint initiating connections.
    pub parent: IpAddr,
    /// Address of the endpoint accepting them.
    pub child: IpAddr,
    /// Child ports the parent may reach.
    pub ports: Vec<TransportPort>,
}

/// Host network operations used by the driver.
pub trait Provisioner: Send + Sync {
    /// Whether a link named `name` exists.
    ///
    /// # Errors
    ///
    /// Fails only if the host cannot be queried.
    fn link_exists(&self, name: &str) -> KeelResult<bool>;

    /// Create a bridge device.
    ///
    /// # Errors
    ///
    /// `LinkExists` if the name is taken.
    fn create_bridge(&self, name: &str) -> KeelResult<()>;

    /// Delete a link (bridge or veth; deleting one veth end removes both).
    ///
    /// # Errors
    ///
    /// `LinkNotFound` if there is no such link.
    fn delete_link(&self, name: &str) -> KeelResult<()>;

    /// List addresses configured on a link.
    ///
    /// # Errors
    ///
    /// `LinkNotFound` if there is no such link.
    fn addresses(&self, name: &str) -> KeelResult<LinkAddresses>;

    /// Add an address to a link.
    ///
    /// # Errors
    ///
    /// `LinkNotFound` if there is no such link.
    fn add_address(&self, name: &str, address: IpNet) -> KeelResult<()>;

    /// Remove an address from a link.
    ///
    /// # Errors
    ///
    /// `LinkNotFound` if there is no such link.
    fn del_address(&self, name: &str, address: IpNet) -> KeelResult<()>;

    /// Destinations of the host's IPv4 routes.
    ///
    /// # Errors
    ///
    /// Fails if the routing table cannot be read.
    fn routes_v4(&self) -> KeelResult<Vec<Ipv4Net>>;

    /// Create a veth pair.
    ///
    /// # Errors
    ///
    /// `LinkExists` if either name is taken.
    fn create_veth(&self, host: &str, peer: &str) -> KeelResult<()>;

    /// Set a link's MTU.
    ///
    /// # Errors
    ///
    /// `LinkNotFound` if there is no such link.
    fn set_mtu(&self, name: &str, mtu: u32) -> KeelResult<()>;

    /// Enslave a link to a bridge.
    ///
    /// # Errors
    ///
    /// `LinkNotFound` if either link is missing.
    fn set_master(&self, name: &str, bridge: &str) -> KeelResult<()>;

    /// Set a link's hardware address.
    ///
    /// # Errors
    ///
    /// `LinkNotFound` if there is no such link.
    fn set_hw_addr(&self, name: &str, mac: MacAddr) -> KeelResult<()>;

    /// Bring a link up.
    ///
    /// # Errors
    ///
    /// `LinkNotFound` if there is no such link.
    fn set_link_up(&self, name: &str) -> KeelResult<()>;

    /// Bring a link down.
    ///
    /// # Errors
    ///
    /// `LinkNotFound` if there is no such link.
    fn set_link_down(&self, name: &str) -> KeelResult<()>;

    /// Write a kernel parameter, `key` in dotted form
    /// (`net.ipv4.ip_forward`).
    ///
    /// # Errors
    ///
    /// Fails if the parameter cannot be written.
    fn set_sysctl(&self, key: &str, value: &str) -> KeelResult<()>;

    /// Install or remove outbound NAT and forwarding for a bridge.
    ///
    /// # Errors
    ///
    /// Fails if a rule cannot be programmed.
    fn set_nat_rules(
        &self,
        bridge: &str,
        subnet: Ipv4Net,
        masquerade: bool,
        enable: bool,
    ) -> KeelResult<()>;

    /// Install or remove isolation between a bridge and its peers.
    ///
    /// # Errors
    ///
    /// Fails if a rule cannot be programmed.
    fn set_isolation_rules(&self, bridge: &str, peers: &[String], enable: bool) -> KeelResult<()>;

    /// Install (`enable`) or remove the rule dropping traffic between
    /// endpoints of the same bridge.
    ///
    /// # Errors
    ///
    /// Fails if a rule cannot be programmed.
    fn set_icc_rules(&self, bridge: &str, enable: bool) -> KeelResult<()>;

    /// Install or remove the rules of an endpoint link.
    ///
    /// # Errors
    ///
    /// Fails if a rule cannot be programmed.
    fn set_link_rules(&self, bridge: &str, link: &LinkRule, enable: bool) -> KeelResult<()>;

    /// Start or stop replaying a bridge's rules after a firewall reload.
    ///
    /// # Errors
    ///
    /// Fails if tracking cannot be changed.
    fn track_firewall_reload(&self, bridge: &str, enable: bool) -> KeelResult<()>;
}
