//! Bridge setup steps, in pipeline order.
//!
//! Each step changes the host through the [`SetupEnv`] collaborators and
//! records what it did on the bridge so cleanup can undo it.

use std::net::{IpAddr, Ipv6Addr};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use keel_common::{KeelError, KeelResult};

use crate::config::{DEFAULT_BRIDGE_NAME, NetworkConfig};
use crate::interface::BridgeInterface;
use crate::netutils::overlaps;
use crate::setup::SetupEnv;

/// Bridge addresses tried, in order, when none is configured.
const BRIDGE_ADDRESS_CANDIDATES: [&str; 12] = [
    "172.17.42.1/16",
    "10.0.42.1/16",
    "10.1.42.1/16",
    "10.42.42.1/16",
    "172.16.42.1/24",
    "172.16.43.1/24",
    "172.16.44.1/24",
    "10.0.42.1/24",
    "10.0.43.1/24",
    "192.168.42.1/24",
    "192.168.43.1/24",
    "192.168.44.1/24",
];

/// Link-local address of the bridge, also the default IPv6 gateway.
const BRIDGE_IPV6: Ipv6Addr = Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1);

fn bridge_ipv4(bridge: &BridgeInterface) -> KeelResult<Ipv4Net> {
    bridge.bridge_ipv4.ok_or_else(|| {
        KeelError::internal(format!("bridge {} has no IPv4 address yet", bridge.name))
    })
}

/// Create the bridge device.
pub fn setup_device(
    env: &SetupEnv<'_>,
    config: &NetworkConfig,
    bridge: &mut BridgeInterface,
) -> KeelResult<()> {
    if bridge.name != DEFAULT_BRIDGE_NAME && !config.allow_non_default_bridge {
        return Err(KeelError::NonDefaultBridge {
            name: bridge.name.clone(),
        });
    }

    env.provisioner.create_bridge(&bridge.name)?;
    bridge.applied.created = true;
    tracing::debug!(bridge = %bridge.name, "Created bridge device");
    Ok(())
}

/// Pick the first candidate subnet clear of host routes and other bridges.
/// First candidate bridge subnet clear of the host routes and of the
/// subnets other networks use.
///
/// # Errors
///
/// [`KeelError::AddressSpaceExhausted`] when every candidate is in use.
pub fn elect_bridge_ipv4(routes: &[Ipv4Net], taken: &[Ipv4Net]) -> KeelResult<Ipv4Net> {
    BRIDGE_ADDRESS_CANDIDATES
        .iter()
        .filter_map(|candidate| candidate.parse::<Ipv4Net>().ok())
        .find(|candidate| {
            !routes
                .iter()
                .filter(|route| route.prefix_len() > 0)
                .chain(taken)
                .any(|used| overlaps(candidate, used))
        })
        .ok_or_else(|| KeelError::AddressSpaceExhausted {
            network: "bridge address candidates".to_string(),
        })
}

/// Assign the bridge IPv4 address, electing one if none is configured.
/// A device carrying other IPv4 addresses is readdressed.
pub fn setup_bridge_ipv4(
    env: &SetupEnv<'_>,
    config: &NetworkConfig,
    bridge: &mut BridgeInterface,
) -> KeelResult<()> {
    let address = match bridge.bridge_ipv4.or(config.address_ipv4) {
        Some(address) => address,
        None => elect_bridge_ipv4(&env.provisioner.routes_v4()?, &env.taken_subnets)?,
    };

    let current = env.provisioner.addresses(&bridge.name)?;
    if !current.v4.contains(&address) {
        for old in &current.v4 {
            env.provisioner.del_address(&bridge.name, IpNet::V4(*old))?;
            bridge.applied.replaced.push(IpNet::V4(*old));
        }
        env.provisioner.add_address(&bridge.name, IpNet::V4(address))?;
        bridge.applied.added.push(IpNet::V4(address));
    }

    bridge.bridge_ipv4 = Some(address);
    bridge.gateway_ipv4 = Some(address.addr());
    tracing::debug!(bridge = %bridge.name, %address, "Bridge IPv4 address set");
    Ok(())
}

/// Enable IPv6 on the device and give it its link-local address.
pub fn setup_bridge_ipv6(
    env: &SetupEnv<'_>,
    _config: &NetworkConfig,
    bridge: &mut BridgeInterface,
) -> KeelResult<()> {
    env.provisioner
        .set_sysctl(&format!("net.ipv6.conf.{}.disable_ipv6", bridge.name), "0")?;

    let address = Ipv6Net::new(BRIDGE_IPV6, 64)
        .map_err(|e| KeelError::internal(format!("bad bridge IPv6 prefix: {e}")))?;
    let current = env.provisioner.addresses(&bridge.name)?;
    if !current.v6.contains(&address) {
        env.provisioner.add_address(&bridge.name, IpNet::V6(address))?;
        bridge.applied.added.push(IpNet::V6(address));
    }

    bridge.bridge_ipv6 = Some(address);
    bridge.gateway_ipv6 = Some(BRIDGE_IPV6);
    Ok(())
}

/// Check that a pre-existing device carries the expected addresses.
pub fn verify_and_reconcile(
    env: &SetupEnv<'_>,
    config: &NetworkConfig,
    bridge: &mut BridgeInterface,
) -> KeelResult<()> {
    let expected = bridge_ipv4(bridge)?;
    let current = env.provisioner.addresses(&bridge.name)?;

    match current.v4.first() {
        Some(found) if *found == expected => {}
        found => {
            return Err(KeelError::BridgeAddressMismatch {
                bridge: bridge.name.clone(),
                expected: expected.to_string(),
                found: found.map_or_else(|| "none".to_string(), ToString::to_string),
            });
        }
    }

    if config.enable_ipv6 {
        if let Some(expected) = bridge.bridge_ipv6 {
            if !current.v6.contains(&expected) {
                return Err(KeelError::BridgeAddressMismatch {
                    bridge: bridge.name.clone(),
                    expected: expected.to_string(),
                    found: format!("{:?}", current.v6),
                });
            }
        }
    }

    Ok(())
}

/// Restrict container IPv4 allocation to the fixed subnet.
pub fn setup_fixed_cidr_v4(
    env: &SetupEnv<'_>,
    config: &NetworkConfig,
    bridge: &mut BridgeInterface,
) -> KeelResult<()> {
    let Some(fixed) = config.fixed_cidr else {
        return Ok(());
    };
    let network = IpNet::V4(bridge_ipv4(bridge)?.trunc());

    env.ipam.register_subnet(network, IpNet::V4(fixed))?;
    bridge.applied.registered.push(network);
    tracing::debug!(bridge = %bridge.name, %fixed, "Fixed IPv4 container subnet registered");
    Ok(())
}

/// Register the fixed IPv6 subnet for container allocation.
pub fn setup_fixed_cidr_v6(
    env: &SetupEnv<'_>,
    config: &NetworkConfig,
    bridge: &mut BridgeInterface,
) -> KeelResult<()> {
    let Some(fixed) = config.fixed_cidr_v6 else {
        return Ok(());
    };
    let network = IpNet::V6(fixed.trunc());

    env.ipam.register_subnet(network, network)?;
    bridge.applied.registered.push(network);
    tracing::debug!(bridge = %bridge.name, %fixed, "Fixed IPv6 container subnet registered");
    Ok(())
}

/// Turn on IPv6 forwarding host-wide.
pub fn setup_ipv6_forwarding(
    env: &SetupEnv<'_>,
    _config: &NetworkConfig,
    _bridge: &mut BridgeInterface,
) -> KeelResult<()> {
    env.provisioner
        .set_sysctl("net.ipv6.conf.default.forwarding", "1")?;
    env.provisioner.set_sysctl("net.ipv6.conf.all.forwarding", "1")
}

/// Allow DNAT to loopback-sourced traffic on the bridge.
pub fn setup_loopback_routing(
    env: &SetupEnv<'_>,
    _config: &NetworkConfig,
    bridge: &mut BridgeInterface,
) -> KeelResult<()> {
    env.provisioner
        .set_sysctl(&format!("net.ipv4.conf.{}.route_localnet", bridge.name), "1")
}

/// Install outbound NAT and forwarding for the bridge subnet.
pub fn setup_nat(
    env: &SetupEnv<'_>,
    config: &NetworkConfig,
    bridge: &mut BridgeInterface,
) -> KeelResult<()> {
    let subnet = bridge_ipv4(bridge)?;
    let masquerade = config.enable_ip_masquerade;

    env.provisioner
        .set_nat_rules(&bridge.name, subnet, masquerade, true)?;
    bridge.applied.nat = Some((subnet, masquerade));
    Ok(())
}

/// Replay the bridge's rules when the host firewall reloads.
pub fn setup_firewall_tracking(
    env: &SetupEnv<'_>,
    _config: &NetworkConfig,
    bridge: &mut BridgeInterface,
) -> KeelResult<()> {
    env.provisioner.track_firewall_reload(&bridge.name, true)?;
    bridge.applied.tracked = true;
    Ok(())
}

/// Use the configured IPv4 gateway and reserve it.
pub fn setup_gateway_ipv4(
    env: &SetupEnv<'_>,
    config: &NetworkConfig,
    bridge: &mut BridgeInterface,
) -> KeelResult<()> {
    let Some(gateway) = config.default_gateway_ipv4 else {
        return Ok(());
    };
    let subnet = bridge_ipv4(bridge)?;
    if !subnet.contains(&gateway) {
        return Err(KeelError::InvalidGateway {
            gateway: gateway.to_string(),
            subnet: subnet.trunc().to_string(),
        });
    }

    // The bridge address itself is reserved by allocate_bridge_ip.
    if gateway != subnet.addr() {
        let network = IpNet::V4(subnet.trunc());
        let ip = env.ipam.request_ip(network, Some(IpAddr::V4(gateway)))?;
        bridge.applied.reserved.push((network, ip));
    }

    bridge.gateway_ipv4 = Some(gateway);
    Ok(())
}

/// Use the configured IPv6 gateway and reserve it.
pub fn setup_gateway_ipv6(
    env: &SetupEnv<'_>,
    config: &NetworkConfig,
    bridge: &mut BridgeInterface,
) -> KeelResult<()> {
    let (Some(gateway), Some(fixed)) = (config.default_gateway_ipv6, config.fixed_cidr_v6) else {
        return Ok(());
    };

    let network = IpNet::V6(fixed.trunc());
    let ip = env.ipam.request_ip(network, Some(IpAddr::V6(gateway)))?;
    bridge.applied.reserved.push((network, ip));
    bridge.gateway_ipv6 = Some(gateway);
    Ok(())
}

/// Isolate the bridge from every other network's bridge.
pub fn setup_isolation(
    env: &SetupEnv<'_>,
    _config: &NetworkConfig,
    bridge: &mut BridgeInterface,
) -> KeelResult<()> {
    let peers: Vec<String> = env
        .peer_bridges
        .iter()
        .filter(|peer| **peer != bridge.name)
        .cloned()
        .collect();
    if peers.is_empty() {
        return Ok(());
    }

    env.provisioner
        .set_isolation_rules(&bridge.name, &peers, true)?;
    bridge.applied.isolated_from = peers;
    Ok(())
}

/// Drop traffic between endpoints of the bridge.
pub fn setup_icc_filtering(
    env: &SetupEnv<'_>,
    _config: &NetworkConfig,
    bridge: &mut BridgeInterface,
) -> KeelResult<()> {
    env.provisioner
        .set_sysctl("net.bridge.bridge-nf-call-iptables", "1")?;
    env.provisioner.set_icc_rules(&bridge.name, true)?;
    bridge.applied.icc_dropped = true;
    Ok(())
}

/// Reserve the bridge address so no endpoint is handed it.
pub fn allocate_bridge_ip(
    env: &SetupEnv<'_>,
    _config: &NetworkConfig,
    bridge: &mut BridgeInterface,
) -> KeelResult<()> {
    let subnet = bridge_ipv4(bridge)?;
    let network = IpNet::V4(subnet.trunc());
    let ip = env
        .ipam
        .request_ip(network, Some(IpAddr::V4(subnet.addr())))?;
    bridge.applied.reserved.push((network, ip));
    Ok(())
}

/// Bring the device up.
pub fn setup_device_up(
    env: &SetupEnv<'_>,
    _config: &NetworkConfig,
    bridge: &mut BridgeInterface,
) -> KeelResult<()> {
    env.provisioner.set_link_up(&bridge.name)
}
