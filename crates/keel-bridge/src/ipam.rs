//! IP address management for bridge networks.
//!
//! [`AddressSpace`] is an explicitly constructed allocator: the process that
//! wires up a driver owns it and hands it in, so separate drivers (and
//! tests) never share allocation state.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use ipnet::IpNet;
use keel_common::{KeelError, KeelResult};
use parking_lot::Mutex;

/// Upper bound on candidates scanned in one IPv6 allocation.
const MAX_V6_SCAN: usize = 65536;

/// Address allocation contract used by the driver.
pub trait IpAllocator: Send + Sync {
    /// Restrict dynamic allocation in `network` to `subnet`.
    ///
    /// # Errors
    ///
    /// Fails if `subnet` is outside `network` or a range is already set.
    fn register_subnet(&self, network: IpNet, subnet: IpNet) -> KeelResult<()>;

    /// Forget `network` and everything allocated in it.
    ///
    /// # Errors
    ///
    /// Implementations may fail on backend errors; unknown networks are not
    /// an error.
    fn unregister_subnet(&self, network: IpNet) -> KeelResult<()>;

    /// Allocate `preferred`, or the lowest free address when `None`.
    ///
    /// # Errors
    ///
    /// [`KeelError::AddressUnavailable`] if `preferred` cannot be handed
    /// out, [`KeelError::AddressSpaceExhausted`] if nothing is free.
    fn request_ip(&self, network: IpNet, preferred: Option<IpAddr>) -> KeelResult<IpAddr>;

    /// Return an address. Releasing a free address is a no-op.
    ///
    /// # Errors
    ///
    /// Implementations may fail on backend errors.
    fn release_ip(&self, network: IpNet, ip: IpAddr) -> KeelResult<()>;
}

#[derive(Debug)]
struct Pool {
    network: IpNet,
    range: Option<IpNet>,
    allocated: HashSet<IpAddr>,
}

impl Pool {
    fn new(network: IpNet) -> Self {
        Self {
            network,
            range: None,
            allocated: HashSet::new(),
        }
    }

    /// Network and broadcast addresses of the pool are never handed out.
    fn is_reserved(&self, ip: IpAddr) -> bool {
        match self.network {
            IpNet::V4(net) if net.prefix_len() < 31 => {
                ip == IpAddr::V4(net.network()) || ip == IpAddr::V4(net.broadcast())
            }
            IpNet::V6(net) if net.prefix_len() < 127 => ip == IpAddr::V6(net.network()),
            _ => false,
        }
    }

    fn allocate(&mut self) -> Option<IpAddr> {
        let scope = self.range.unwrap_or(self.network);
        let found = match scope {
            IpNet::V4(net) => net
                .hosts()
                .map(IpAddr::V4)
                .find(|ip| !self.is_reserved(*ip) && !self.allocated.contains(ip)),
            IpNet::V6(net) => net
                .hosts()
                .take(MAX_V6_SCAN)
                .map(IpAddr::V6)
                .find(|ip| !self.is_reserved(*ip) && !self.allocated.contains(ip)),
        }?;
        self.allocated.insert(found);
        Some(found)
    }

    fn allocate_specific(&mut self, ip: IpAddr) -> KeelResult<IpAddr> {
        let unavailable = |reason: &str| KeelError::AddressUnavailable {
            address: ip.to_string(),
            network: self.network.to_string(),
            reason: reason.to_string(),
        };

        if !self.network.contains(&ip) {
            return Err(unavailable("outside the network"));
        }
        if self.is_reserved(ip) {
            return Err(unavailable("reserved address"));
        }
        if self.allocated.contains(&ip) {
            return Err(unavailable("already allocated"));
        }

        self.allocated.insert(ip);
        Ok(ip)
    }
}

/// In-process [`IpAllocator`], one pool per network.
///
/// Pools are created on first use and dropped once empty, unless a range
/// was registered for them.
#[derive(Debug, Default)]
pub struct AddressSpace {
    pools: Mutex<HashMap<IpNet, Pool>>,
}

impl AddressSpace {
    /// Create an empty address space.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `ip` is currently allocated in `network`.
    pub fn is_allocated(&self, network: IpNet, ip: IpAddr) -> bool {
        self.pools
            .lock()
            .get(&network.trunc())
            .is_some_and(|pool| pool.allocated.contains(&ip))
    }

    /// Number of networks with a live pool.
    pub fn pool_count(&self) -> usize {
        self.pools.lock().len()
    }
}

impl IpAllocator for AddressSpace {
    fn register_subnet(&self, network: IpNet, subnet: IpNet) -> KeelResult<()> {
        let network = network.trunc();
        let subnet = subnet.trunc();
        if !network.contains(&subnet) {
            return Err(KeelError::InvalidContainerSubnet {
                subnet: subnet.to_string(),
                network: network.to_string(),
            });
        }

        let mut pools = self.pools.lock();
        let pool = pools.entry(network).or_insert_with(|| Pool::new(network));
        if let Some(existing) = pool.range {
            return Err(KeelError::forbidden(format!(
                "network {network} already has range {existing} registered"
            )));
        }
        pool.range = Some(subnet);

        tracing::debug!(%network, %subnet, "Registered allocation range");
        Ok(())
    }

    fn unregister_subnet(&self, network: IpNet) -> KeelResult<()> {
        let network = network.trunc();
        if self.pools.lock().remove(&network).is_some() {
            tracing::debug!(%network, "Unregistered network");
        }
        Ok(())
    }

    fn request_ip(&self, network: IpNet, preferred: Option<IpAddr>) -> KeelResult<IpAddr> {
        let network = network.trunc();
        let mut pools = self.pools.lock();
        let pool = pools.entry(network).or_insert_with(|| Pool::new(network));

        let result = match preferred {
            Some(ip) => pool.allocate_specific(ip),
            None => pool.allocate().ok_or_else(|| KeelError::AddressSpaceExhausted {
                network: network.to_string(),
            }),
        };

        if result.is_err() && pool.allocated.is_empty() && pool.range.is_none() {
            pools.remove(&network);
        }
        result
    }

    fn release_ip(&self, network: IpNet, ip: IpAddr) -> KeelResult<()> {
        let network = network.trunc();
        let mut pools = self.pools.lock();
        if let Some(pool) = pools.get_mut(&network) {
            pool.allocated.remove(&ip);
            if pool.allocated.is_empty() && pool.range.is_none() {
                pools.remove(&network);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn lowest_free_address_first() {
        let space = AddressSpace::new();
        let network = net("172.18.0.1/16");
        assert_eq!(space.request_ip(network, None).unwrap(), v4(172, 18, 0, 1));
        assert_eq!(space.request_ip(network, None).unwrap(), v4(172, 18, 0, 2));

        space.release_ip(network, v4(172, 18, 0, 1)).unwrap();
        assert_eq!(space.request_ip(network, None).unwrap(), v4(172, 18, 0, 1));
    }

    #[test]
    fn preferred_address() {
        let space = AddressSpace::new();
        let network = net("10.0.0.0/24");
        assert_eq!(
            space.request_ip(network, Some(v4(10, 0, 0, 1))).unwrap(),
            v4(10, 0, 0, 1)
        );
        assert_eq!(space.request_ip(network, None).unwrap(), v4(10, 0, 0, 2));

        let err = space.request_ip(network, Some(v4(10, 0, 0, 1))).unwrap_err();
        assert!(matches!(err, KeelError::AddressUnavailable { .. }));
        let err = space.request_ip(network, Some(v4(10, 0, 1, 1))).unwrap_err();
        assert!(matches!(err, KeelError::AddressUnavailable { .. }));
        let err = space.request_ip(network, Some(v4(10, 0, 0, 255))).unwrap_err();
        assert!(matches!(err, KeelError::AddressUnavailable { .. }));
    }

    #[test]
    fn registered_range_limits_dynamic_allocation() {
        let space = AddressSpace::new();
        let network = net("172.18.0.0/16");
        space.register_subnet(network, net("172.18.1.0/24")).unwrap();

        // The bridge address may sit outside the range.
        space.request_ip(network, Some(v4(172, 18, 0, 1))).unwrap();
        assert_eq!(space.request_ip(network, None).unwrap(), v4(172, 18, 1, 1));

        assert!(space.register_subnet(network, net("172.18.2.0/24")).is_err());
        assert!(space.register_subnet(net("10.0.0.0/16"), net("10.1.0.0/24")).is_err());

        space.unregister_subnet(network).unwrap();
        assert!(!space.is_allocated(network, v4(172, 18, 1, 1)));
        assert_eq!(space.pool_count(), 0);
    }

    #[test]
    fn exhaustion() {
        let space = AddressSpace::new();
        let network = net("192.168.7.0/30");
        space.request_ip(network, None).unwrap();
        space.request_ip(network, None).unwrap();
        let err = space.request_ip(network, None).unwrap_err();
        assert!(matches!(err, KeelError::AddressSpaceExhausted { .. }));
    }

    #[test]
    fn release_is_idempotent_and_drops_empty_pools() {
        let space = AddressSpace::new();
        let network = net("10.1.0.0/24");
        let ip = space.request_ip(network, None).unwrap();
        space.release_ip(network, ip).unwrap();
        space.release_ip(network, ip).unwrap();
        space.release_ip(net("10.9.0.0/24"), ip).unwrap();
        assert_eq!(space.pool_count(), 0);
    }

    #[test]
    fn ipv6_allocation() {
        let space = AddressSpace::new();
        let network = net("2001:db8::/64");
        let first = space.request_ip(network, None).unwrap();
        assert_eq!(first, IpAddr::V6("2001:db8::1".parse::<Ipv6Addr>().unwrap()));

        let preferred: IpAddr = "2001:db8::242:ac12:2".parse().unwrap();
        assert_eq!(space.request_ip(network, Some(preferred)).unwrap(), preferred);
        assert!(space.request_ip(network, Some(preferred)).is_err());
    }
}
