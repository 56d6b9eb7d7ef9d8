//! The host bridge backing a network.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use keel_common::KeelResult;

use crate::config::NetworkConfig;
use crate::ipam::IpAllocator;
use crate::provision::Provisioner;

/// Host effects of the setup pipeline, undone in reverse by cleanup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Applied {
    /// The device was created by the pipeline.
    pub created: bool,
    /// Addresses removed from a pre-existing device.
    pub replaced: Vec<IpNet>,
    /// Addresses added to the device.
    pub added: Vec<IpNet>,
    /// Addresses reserved in the allocator.
    pub reserved: Vec<(IpNet, IpAddr)>,
    /// Networks with a registered allocation range.
    pub registered: Vec<IpNet>,
    /// Outbound NAT installed for this subnet, with masquerading or not.
    pub nat: Option<(Ipv4Net, bool)>,
    /// Firewall reload tracking is on.
    pub tracked: bool,
    /// Peer bridges isolation rules were installed against.
    pub isolated_from: Vec<String>,
    /// The ICC drop rule is installed.
    pub icc_dropped: bool,
}

/// Reference to the bridge device of a network and its addressing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeInterface {
    /// Device name.
    pub name: String,
    /// The device existed before the network was created.
    pub pre_existing: bool,
    /// Bridge address and subnet.
    pub bridge_ipv4: Option<Ipv4Net>,
    /// Bridge IPv6 address, when IPv6 is enabled.
    pub bridge_ipv6: Option<Ipv6Net>,
    /// IPv4 gateway handed to endpoints.
    pub gateway_ipv4: Option<Ipv4Addr>,
    /// IPv6 gateway handed to endpoints.
    pub gateway_ipv6: Option<Ipv6Addr>,
    /// What the setup pipeline did.
    pub applied: Applied,
}

impl BridgeInterface {
    /// Build the reference for `config`, defaulting the device name and
    /// looking up whether the device already exists. Nothing on the host is
    /// changed.
    ///
    /// # Errors
    ///
    /// Fails if the host cannot be queried.
    pub fn resolve(config: &NetworkConfig, provisioner: &dyn Provisioner) -> KeelResult<Self> {
        let name = config.effective_bridge_name().to_string();
        let pre_existing = provisioner.link_exists(&name)?;

        Ok(Self {
            name,
            pre_existing,
            bridge_ipv4: config.address_ipv4,
            bridge_ipv6: None,
            gateway_ipv4: None,
            gateway_ipv6: None,
            applied: Applied::default(),
        })
    }

    /// The bridge subnet as an allocator network.
    #[must_use]
    pub fn ipv4_network(&self) -> Option<IpNet> {
        self.bridge_ipv4.map(|net| IpNet::V4(net.trunc()))
    }

    /// Remove the isolation rules installed against peer bridges.
    ///
    /// # Errors
    ///
    /// Fails if the rules cannot be removed; they stay recorded then.
    pub fn remove_isolation(&mut self, provisioner: &dyn Provisioner) -> KeelResult<()> {
        if self.applied.isolated_from.is_empty() {
            return Ok(());
        }
        provisioner.set_isolation_rules(&self.name, &self.applied.isolated_from, false)?;
        self.applied.isolated_from.clear();
        Ok(())
    }

    /// Undo everything recorded in [`Applied`], newest first.
    ///
    /// Every step is attempted; failures are logged and skipped.
    pub fn unwind(&mut self, provisioner: &dyn Provisioner, ipam: &dyn IpAllocator) {
        let name = self.name.clone();
        let applied = std::mem::take(&mut self.applied);

        let warn = |what: &str, result: KeelResult<()>| {
            if let Err(e) = result {
                tracing::warn!(bridge = %name, error = %e, "Failed to {what}");
            }
        };

        for (network, ip) in applied.reserved.iter().rev() {
            warn("release address", ipam.release_ip(*network, *ip));
        }
        for network in applied.registered.iter().rev() {
            warn("unregister subnet", ipam.unregister_subnet(*network));
        }
        if applied.icc_dropped {
            warn("remove ICC rules", provisioner.set_icc_rules(&name, false));
        }
        if !applied.isolated_from.is_empty() {
            warn(
                "remove isolation rules",
                provisioner.set_isolation_rules(&name, &applied.isolated_from, false),
            );
        }
        if applied.tracked {
            warn(
                "stop firewall reload tracking",
                provisioner.track_firewall_reload(&name, false),
            );
        }
        if let Some((subnet, masquerade)) = applied.nat {
            warn(
                "remove NAT rules",
                provisioner.set_nat_rules(&name, subnet, masquerade, false),
            );
        }
        if !applied.created {
            for address in applied.added.iter().rev() {
                warn("remove bridge address", provisioner.del_address(&name, *address));
            }
            for address in &applied.replaced {
                warn("restore bridge address", provisioner.add_address(&name, *address));
            }
        }
        if applied.created {
            match provisioner.delete_link(&name) {
                Err(e) if !e.is_link_not_found() => {
                    tracing::warn!(bridge = %name, error = %e, "Failed to delete bridge");
                }
                _ => tracing::debug!(bridge = %name, "Deleted bridge"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeHost;
    use crate::ipam::AddressSpace;

    #[test]
    fn resolve_defaults_name_and_checks_host() {
        let host = FakeHost::new();
        let config = NetworkConfig::default();
        let bridge = BridgeInterface::resolve(&config, &host).unwrap();
        assert_eq!(bridge.name, "keel0");
        assert!(!bridge.pre_existing);

        host.add_bridge("keel0", &[]);
        assert!(BridgeInterface::resolve(&config, &host).unwrap().pre_existing);
        assert!(host.events().is_empty(), "resolve must not touch the host");
    }

    #[test]
    fn unwind_reverses_recorded_effects() {
        let host = FakeHost::new();
        let ipam = AddressSpace::new();
        let subnet: Ipv4Net = "172.18.0.1/16".parse().unwrap();
        let network = IpNet::V4(subnet.trunc());

        host.create_bridge("br0").unwrap();
        host.set_icc_rules("br0", true).unwrap();
        host.set_nat_rules("br0", subnet, true, true).unwrap();
        let ip = ipam.request_ip(network, Some(IpAddr::V4(subnet.addr()))).unwrap();

        let mut bridge = BridgeInterface {
            name: "br0".to_string(),
            pre_existing: false,
            bridge_ipv4: Some(subnet),
            bridge_ipv6: None,
            gateway_ipv4: Some(subnet.addr()),
            gateway_ipv6: None,
            applied: Applied {
                created: true,
                reserved: vec![(network, ip)],
                nat: Some((subnet, true)),
                icc_dropped: true,
                ..Applied::default()
            },
        };
        host.fail_on("set_icc_rules");
        bridge.unwind(&host, &ipam);

        assert!(host.link("br0").is_none());
        assert!(!ipam.is_allocated(network, ip));
        assert_eq!(host.rules(), vec!["icc-drop br0".to_string()]);
        assert_eq!(bridge.applied, Applied::default());
    }

    #[test]
    fn unwind_restores_addresses_of_pre_existing_device() {
        let host = FakeHost::new();
        let ipam = AddressSpace::new();
        let old: IpNet = "192.168.1.1/24".parse().unwrap();
        let new: IpNet = "172.18.0.1/16".parse().unwrap();
        host.add_bridge("br0", &[new, old]);
        host.del_address("br0", old).unwrap();

        let mut bridge = BridgeInterface {
            name: "br0".to_string(),
            pre_existing: true,
            bridge_ipv4: None,
            bridge_ipv6: None,
            gateway_ipv4: None,
            gateway_ipv6: None,
            applied: Applied {
                replaced: vec![old],
                added: vec![new],
                ..Applied::default()
            },
        };
        bridge.unwind(&host, &ipam);

        assert_eq!(host.link("br0").unwrap().addresses, vec![old]);
        assert!(!host.saw("delete_link"));
    }
}
