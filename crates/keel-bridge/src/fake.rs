//! In-memory host for tests and dry runs.
//!
//! [`FakeHost`] implements [`Provisioner`] over a model of links, sysctls
//! and rule sets, records every operation it is asked to perform and can be
//! told to fail a given operation. [`MemoryPortMapper`] does the same for
//! port forwarding.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};

use ipnet::{IpNet, Ipv4Net};
use keel_common::{KeelError, KeelResult};
use parking_lot::Mutex;

use crate::netutils::MacAddr;
use crate::portmap::{PortAllocator, PortMapper, Protocol};
use crate::provision::{LinkAddresses, LinkRule, Provisioner};

/// Kind of a fake link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    /// A bridge device.
    Bridge,
    /// One end of a veth pair.
    Veth {
        /// The other end.
        peer: String,
    },
}

/// State of a fake link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeLink {
    /// Device kind.
    pub kind: LinkKind,
    /// Bridge the link is enslaved to.
    pub master: Option<String>,
    /// Configured MTU.
    pub mtu: Option<u32>,
    /// Configured hardware address.
    pub mac: Option<MacAddr>,
    /// Administrative state.
    pub up: bool,
    /// Configured addresses.
    pub addresses: Vec<IpNet>,
}

impl FakeLink {
    fn new(kind: LinkKind) -> Self {
        Self {
            kind,
            master: None,
            mtu: None,
            mac: None,
            up: false,
            addresses: Vec::new(),
        }
    }
}

#[derive(Default)]
struct FakeState {
    links: BTreeMap<String, FakeLink>,
    routes: Vec<Ipv4Net>,
    sysctls: BTreeMap<String, String>,
    rules: BTreeSet<String>,
    tracked: BTreeSet<String>,
    events: Vec<String>,
    failures: HashSet<String>,
}

impl FakeState {
    /// Log `op` and fail it if a failure was injected.
    fn begin(&mut self, op: &str, detail: impl std::fmt::Display) -> KeelResult<()> {
        let event = format!("{op} {detail}");
        if self.failures.contains(op) {
            self.events.push(format!("{event} (failed)"));
            return Err(KeelError::CommandFailed {
                command: event,
                message: "injected failure".to_string(),
            });
        }
        self.events.push(event);
        Ok(())
    }

    fn link_mut(&mut self, name: &str) -> KeelResult<&mut FakeLink> {
        self.links.get_mut(name).ok_or_else(|| KeelError::LinkNotFound {
            name: name.to_string(),
        })
    }

    fn set_rules(&mut self, rules: impl IntoIterator<Item = String>, enable: bool) {
        for rule in rules {
            if enable {
                self.rules.insert(rule);
            } else {
                self.rules.remove(&rule);
            }
        }
    }
}

/// In-memory [`Provisioner`].
#[derive(Default)]
pub struct FakeHost {
    state: Mutex<FakeState>,
}

impl FakeHost {
    /// An empty host.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a bridge as if created by someone else.
    pub fn add_bridge(&self, name: &str, addresses: &[IpNet]) {
        let mut link = FakeLink::new(LinkKind::Bridge);
        link.addresses = addresses.to_vec();
        self.state.lock().links.insert(name.to_string(), link);
    }

    /// Add a host route.
    pub fn add_route(&self, destination: Ipv4Net) {
        self.state.lock().routes.push(destination);
    }

    /// Make every later call of `op` fail.
    pub fn fail_on(&self, op: &str) {
        self.state.lock().failures.insert(op.to_string());
    }

    /// Stop injecting failures.
    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Every operation attempted so far, in order.
    pub fn events(&self) -> Vec<String> {
        self.state.lock().events.clone()
    }

    /// Whether an event starting with `prefix` was recorded.
    pub fn saw(&self, prefix: &str) -> bool {
        self.state.lock().events.iter().any(|e| e.starts_with(prefix))
    }

    /// Forget recorded events.
    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    /// Current state of a link.
    pub fn link(&self, name: &str) -> Option<FakeLink> {
        self.state.lock().links.get(name).cloned()
    }

    /// Names of all links.
    pub fn link_names(&self) -> Vec<String> {
        self.state.lock().links.keys().cloned().collect()
    }

    /// Current value of a kernel parameter.
    pub fn sysctl(&self, key: &str) -> Option<String> {
        self.state.lock().sysctls.get(key).cloned()
    }

    /// Installed rules, in a stable textual form.
    pub fn rules(&self) -> Vec<String> {
        self.state.lock().rules.iter().cloned().collect()
    }

    /// Whether firewall reloads are tracked for `bridge`.
    pub fn is_tracked(&self, bridge: &str) -> bool {
        self.state.lock().tracked.contains(bridge)
    }
}

impl Provisioner for FakeHost {
    fn link_exists(&self, name: &str) -> KeelResult<bool> {
        Ok(self.state.lock().links.contains_key(name))
    }

    fn create_bridge(&self, name: &str) -> KeelResult<()> {
        let mut state = self.state.lock();
        state.begin("create_bridge", name)?;
        if state.links.contains_key(name) {
            return Err(KeelError::LinkExists {
                name: name.to_string(),
            });
        }
        state
            .links
            .insert(name.to_string(), FakeLink::new(LinkKind::Bridge));
        Ok(())
    }

    fn delete_link(&self, name: &str) -> KeelResult<()> {
        let mut state = self.state.lock();
        state.begin("delete_link", name)?;
        let link = state.links.remove(name).ok_or_else(|| KeelError::LinkNotFound {
            name: name.to_string(),
        })?;
        if let LinkKind::Veth { peer } = link.kind {
            state.links.remove(&peer);
        }
        for other in state.links.values_mut() {
            if other.master.as_deref() == Some(name) {
                other.master = None;
            }
        }
        Ok(())
    }

    fn addresses(&self, name: &str) -> KeelResult<LinkAddresses> {
        let mut state = self.state.lock();
        let link = state.link_mut(name)?;
        let mut addresses = LinkAddresses::default();
        for address in &link.addresses {
            match address {
                IpNet::V4(v4) => addresses.v4.push(*v4),
                IpNet::V6(v6) => addresses.v6.push(*v6),
            }
        }
        Ok(addresses)
    }

    fn add_address(&self, name: &str, address: IpNet) -> KeelResult<()> {
        let mut state = self.state.lock();
        state.begin("add_address", format!("{name} {address}"))?;
        let link = state.link_mut(name)?;
        if !link.addresses.contains(&address) {
            link.addresses.push(address);
        }
        Ok(())
    }

    fn del_address(&self, name: &str, address: IpNet) -> KeelResult<()> {
        let mut state = self.state.lock();
        state.begin("del_address", format!("{name} {address}"))?;
        state.link_mut(name)?.addresses.retain(|a| *a != address);
        Ok(())
    }

    fn routes_v4(&self) -> KeelResult<Vec<Ipv4Net>> {
        Ok(self.state.lock().routes.clone())
    }

    fn create_veth(&self, host: &str, peer: &str) -> KeelResult<()> {
        let mut state = self.state.lock();
        state.begin("create_veth", format!("{host} {peer}"))?;
        for name in [host, peer] {
            if state.links.contains_key(name) {
                return Err(KeelError::LinkExists {
                    name: name.to_string(),
                });
            }
        }
        state.links.insert(
            host.to_string(),
            FakeLink::new(LinkKind::Veth {
                peer: peer.to_string(),
            }),
        );
        state.links.insert(
            peer.to_string(),
            FakeLink::new(LinkKind::Veth {
                peer: host.to_string(),
            }),
        );
        Ok(())
    }

    fn set_mtu(&self, name: &str, mtu: u32) -> KeelResult<()> {
        let mut state = self.state.lock();
        state.begin("set_mtu", format!("{name} {mtu}"))?;
        state.link_mut(name)?.mtu = Some(mtu);
        Ok(())
    }

    fn set_master(&self, name: &str, bridge: &str) -> KeelResult<()> {
        let mut state = self.state.lock();
        state.begin("set_master", format!("{name} {bridge}"))?;
        if !state.links.contains_key(bridge) {
            return Err(KeelError::LinkNotFound {
                name: bridge.to_string(),
            });
        }
        state.link_mut(name)?.master = Some(bridge.to_string());
        Ok(())
    }

    fn set_hw_addr(&self, name: &str, mac: MacAddr) -> KeelResult<()> {
        let mut state = self.state.lock();
        state.begin("set_hw_addr", format!("{name} {mac}"))?;
        state.link_mut(name)?.mac = Some(mac);
        Ok(())
    }

    fn set_link_up(&self, name: &str) -> KeelResult<()> {
        let mut state = self.state.lock();
        state.begin("set_link_up", name)?;
        state.link_mut(name)?.up = true;
        Ok(())
    }

    fn set_link_down(&self, name: &str) -> KeelResult<()> {
        let mut state = self.state.lock();
        state.begin("set_link_down", name)?;
        state.link_mut(name)?.up = false;
        Ok(())
    }

    fn set_sysctl(&self, key: &str, value: &str) -> KeelResult<()> {
        let mut state = self.state.lock();
        state.begin("set_sysctl", format!("{key}={value}"))?;
        state.sysctls.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn set_nat_rules(
        &self,
        bridge: &str,
        subnet: Ipv4Net,
        masquerade: bool,
        enable: bool,
    ) -> KeelResult<()> {
        let mut state = self.state.lock();
        state.begin("set_nat_rules", format!("{bridge} {subnet} {enable}"))?;
        let mut rules = vec![format!("forward {bridge}")];
        if masquerade {
            rules.push(format!("masquerade {bridge} {}", subnet.trunc()));
        }
        state.set_rules(rules, enable);
        Ok(())
    }

    fn set_isolation_rules(&self, bridge: &str, peers: &[String], enable: bool) -> KeelResult<()> {
        let mut state = self.state.lock();
        state.begin("set_isolation_rules", format!("{bridge} {enable}"))?;
        let rules = peers.iter().map(|peer| format!("isolate {bridge} {peer}"));
        state.set_rules(rules, enable);
        Ok(())
    }

    fn set_icc_rules(&self, bridge: &str, enable: bool) -> KeelResult<()> {
        let mut state = self.state.lock();
        state.begin("set_icc_rules", format!("{bridge} {enable}"))?;
        state.set_rules([format!("icc-drop {bridge}")], enable);
        Ok(())
    }

    fn set_link_rules(&self, bridge: &str, link: &LinkRule, enable: bool) -> KeelResult<()> {
        let mut state = self.state.lock();
        state.begin(
            "set_link_rules",
            format!("{bridge} {}->{} {enable}", link.parent, link.child),
        )?;
        let rules = link
            .ports
            .iter()
            .map(|port| format!("link {bridge} {}->{} {port}", link.parent, link.child));
        state.set_rules(rules, enable);
        Ok(())
    }

    fn track_firewall_reload(&self, bridge: &str, enable: bool) -> KeelResult<()> {
        let mut state = self.state.lock();
        state.begin("track_firewall_reload", format!("{bridge} {enable}"))?;
        if enable {
            state.tracked.insert(bridge.to_string());
        } else {
            state.tracked.remove(bridge);
        }
        Ok(())
    }
}

/// In-memory [`PortMapper`].
#[derive(Default)]
pub struct MemoryPortMapper {
    allocator: PortAllocator,
    mappings: Mutex<HashMap<(Protocol, IpAddr, u16), SocketAddr>>,
}

impl MemoryPortMapper {
    /// An empty mapper.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live mappings.
    pub fn mapping_count(&self) -> usize {
        self.mappings.lock().len()
    }

    /// Container address a host port forwards to.
    pub fn target(&self, proto: Protocol, host_ip: IpAddr, host_port: u16) -> Option<SocketAddr> {
        self.mappings.lock().get(&(proto, host_ip, host_port)).copied()
    }
}

impl PortMapper for MemoryPortMapper {
    fn map(
        &self,
        proto: Protocol,
        container: SocketAddr,
        host_ip: IpAddr,
        host_port: u16,
        _userland_proxy: bool,
    ) -> KeelResult<u16> {
        let port = self.allocator.request(proto, host_ip, host_port)?;
        self.mappings.lock().insert((proto, host_ip, port), container);
        Ok(port)
    }

    fn unmap(&self, proto: Protocol, host_ip: IpAddr, host_port: u16) -> KeelResult<()> {
        self.mappings
            .lock()
            .remove(&(proto, host_ip, host_port))
            .ok_or_else(|| KeelError::PortNotMapped {
                proto: proto.to_string(),
                host_ip: host_ip.to_string(),
                port: host_port,
            })?;
        self.allocator.release(proto, host_ip, host_port);
        Ok(())
    }
}
