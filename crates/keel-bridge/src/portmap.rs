//! Port publishing for endpoints.
//!
//! [`allocate_ports`] and [`release_ports`] turn an endpoint's requested
//! bindings into mappings through a [`PortMapper`]. [`IptablesPortMapper`]
//! is the host implementation, backed by a [`PortAllocator`] for host ports.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use keel_common::{KeelError, KeelResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::policy::{self, Rule};

/// First port of the dynamic range.
pub const DYNAMIC_PORT_START: u16 = 49153;
/// Last port of the dynamic range.
pub const DYNAMIC_PORT_END: u16 = 65535;

/// Attempts made for a binding that asks for any host port.
const MAX_ALLOCATE_ATTEMPTS: usize = 10;

/// Transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP protocol.
    Tcp,
    /// UDP protocol.
    Udp,
}

impl Protocol {
    /// The lowercase protocol name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(KeelError::bad_request(format!("unknown protocol '{other}'"))),
        }
    }
}

/// A protocol and port pair exposed by an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransportPort {
    /// Protocol.
    #[serde(rename = "Proto")]
    pub proto: Protocol,
    /// Container port.
    #[serde(rename = "Port")]
    pub port: u16,
}

impl fmt::Display for TransportPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.proto)
    }
}

/// A port binding between host and container.
///
/// As requested, `ip` is unset and `host_port` may be 0 for "any". As
/// resolved, both are filled in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    /// Protocol (TCP or UDP).
    #[serde(rename = "Proto")]
    pub proto: Protocol,
    /// Container address.
    #[serde(rename = "IP", default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
    /// Container port.
    #[serde(rename = "Port")]
    pub port: u16,
    /// Host address to bind, the network's default binding IP when unset.
    #[serde(rename = "HostIP", default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<IpAddr>,
    /// Host port, 0 for a dynamic one.
    #[serde(rename = "HostPort", default)]
    pub host_port: u16,
}

impl PortBinding {
    /// A TCP binding.
    #[must_use]
    pub const fn tcp(port: u16, host_port: u16) -> Self {
        Self {
            proto: Protocol::Tcp,
            ip: None,
            port,
            host_ip: None,
            host_port,
        }
    }

    /// A UDP binding.
    #[must_use]
    pub const fn udp(port: u16, host_port: u16) -> Self {
        Self {
            proto: Protocol::Udp,
            ..Self::tcp(port, host_port)
        }
    }

    /// Bind on a specific host address.
    #[must_use]
    pub const fn with_host_ip(mut self, ip: IpAddr) -> Self {
        self.host_ip = Some(ip);
        self
    }
}

/// Installs and removes host-port forwarding.
///
/// Implementations are shared by every network of a driver and must be
/// internally synchronized.
pub trait PortMapper: Send + Sync {
    /// Forward `host_ip:host_port` to `container`, returning the host port.
    /// A `host_port` of 0 asks for any free port.
    ///
    /// # Errors
    ///
    /// Fails if the host port is taken or the forwarding cannot be installed.
    fn map(
        &self,
        proto: Protocol,
        container: SocketAddr,
        host_ip: IpAddr,
        host_port: u16,
        userland_proxy: bool,
    ) -> KeelResult<u16>;

    /// Remove a forwarding installed by [`PortMapper::map`].
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::PortNotMapped`] for unknown mappings.
    fn unmap(&self, proto: Protocol, host_ip: IpAddr, host_port: u16) -> KeelResult<()>;
}

/// Map every requested binding for `container_ip`.
///
/// On failure, every binding mapped by this call is released again.
///
/// # Errors
///
/// Returns the failure of the first binding that could not be mapped.
pub fn allocate_ports(
    mapper: &dyn PortMapper,
    requested: &[PortBinding],
    container_ip: IpAddr,
    default_host_ip: IpAddr,
    userland_proxy: bool,
) -> KeelResult<Vec<PortBinding>> {
    let mut mapped = Vec::with_capacity(requested.len());
    for binding in requested {
        match allocate_port(mapper, binding, container_ip, default_host_ip, userland_proxy) {
            Ok(binding) => mapped.push(binding),
            Err(e) => {
                if let Err(release_err) = release_ports(mapper, &mapped) {
                    tracing::warn!(error = %release_err, "Failed to release ports after mapping failure");
                }
                return Err(e);
            }
        }
    }
    Ok(mapped)
}

fn allocate_port(
    mapper: &dyn PortMapper,
    requested: &PortBinding,
    container_ip: IpAddr,
    default_host_ip: IpAddr,
    userland_proxy: bool,
) -> KeelResult<PortBinding> {
    let mut binding = requested.clone();
    binding.ip = Some(container_ip);
    let host_ip = *binding.host_ip.get_or_insert(default_host_ip);
    let container = SocketAddr::new(container_ip, binding.port);

    // Only dynamic ports are retried: an explicit port that is taken stays taken.
    let attempts = if binding.host_port == 0 {
        MAX_ALLOCATE_ATTEMPTS
    } else {
        1
    };

    let mut attempt = 1;
    loop {
        match mapper.map(binding.proto, container, host_ip, binding.host_port, userland_proxy) {
            Ok(host_port) => {
                binding.host_port = host_port;
                tracing::debug!(
                    proto = %binding.proto,
                    %host_ip,
                    host_port,
                    %container,
                    "Mapped port"
                );
                return Ok(binding);
            }
            Err(e) if attempt < attempts => {
                tracing::debug!(attempt, error = %e, "Retrying dynamic port allocation");
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Unmap every binding, continuing past failures.
///
/// # Errors
///
/// Returns the last failure; every failure is logged.
pub fn release_ports(mapper: &dyn PortMapper, bindings: &[PortBinding]) -> KeelResult<()> {
    let mut last_err = None;
    for binding in bindings {
        let host_ip = binding
            .host_ip
            .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
        if let Err(e) = mapper.unmap(binding.proto, host_ip, binding.host_port) {
            tracing::warn!(
                proto = %binding.proto,
                %host_ip,
                host_port = binding.host_port,
                error = %e,
                "Failed to release port binding"
            );
            last_err = Some(e);
        }
    }
    last_err.map_or(Ok(()), Err)
}

#[derive(Default)]
struct PortSet {
    used: BTreeSet<u16>,
    last: Option<u16>,
}

/// Host port bookkeeping per protocol and host address.
pub struct PortAllocator {
    start: u16,
    end: u16,
    ports: Mutex<HashMap<(Protocol, IpAddr), PortSet>>,
}

impl PortAllocator {
    /// Allocator over the default dynamic range.
    #[must_use]
    pub fn new() -> Self {
        Self::with_range(DYNAMIC_PORT_START, DYNAMIC_PORT_END)
    }

    /// Allocator handing out dynamic ports between `start` and `end`,
    /// inclusive. Reversed bounds are swapped.
    #[must_use]
    pub fn with_range(start: u16, end: u16) -> Self {
        Self {
            start: start.min(end),
            end: start.max(end),
            ports: Mutex::new(HashMap::new()),
        }
    }

    /// Claim `port`, or the next free dynamic port when `port` is 0.
    ///
    /// # Errors
    ///
    /// [`KeelError::PortAlreadyAllocated`] for a taken explicit port,
    /// [`KeelError::NoAvailablePorts`] when the dynamic range is exhausted.
    pub fn request(&self, proto: Protocol, ip: IpAddr, port: u16) -> KeelResult<u16> {
        let mut ports = self.ports.lock();
        let set = ports.entry((proto, ip)).or_default();

        if port != 0 {
            if !set.used.insert(port) {
                return Err(KeelError::PortAlreadyAllocated {
                    proto: proto.to_string(),
                    host_ip: ip.to_string(),
                    port,
                });
            }
            return Ok(port);
        }

        // Round-robin from the last dynamic port handed out.
        let span = u32::from(self.end - self.start) + 1;
        let offset = set
            .last
            .map_or(0, |last| u32::from(last - self.start) + 1);
        for step in 0..span {
            let candidate = self.start + ((offset + step) % span) as u16;
            if set.used.insert(candidate) {
                set.last = Some(candidate);
                return Ok(candidate);
            }
        }

        Err(KeelError::NoAvailablePorts {
            proto: proto.to_string(),
            host_ip: ip.to_string(),
        })
    }

    /// Give back a port. Releasing a free port is a no-op.
    pub fn release(&self, proto: Protocol, ip: IpAddr, port: u16) {
        let mut ports = self.ports.lock();
        if let Some(set) = ports.get_mut(&(proto, ip)) {
            set.used.remove(&port);
        }
    }

    /// Whether `port` is currently claimed.
    pub fn is_allocated(&self, proto: Protocol, ip: IpAddr, port: u16) -> bool {
        self.ports
            .lock()
            .get(&(proto, ip))
            .is_some_and(|set| set.used.contains(&port))
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// [`PortMapper`] programming NAT rules with `iptables(8)`.
pub struct IptablesPortMapper {
    allocator: PortAllocator,
    mappings: Mutex<HashMap<(Protocol, IpAddr, u16), Vec<Rule>>>,
}

impl IptablesPortMapper {
    /// Create a mapper with an empty allocator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            allocator: PortAllocator::new(),
            mappings: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for IptablesPortMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl PortMapper for IptablesPortMapper {
    fn map(
        &self,
        proto: Protocol,
        container: SocketAddr,
        host_ip: IpAddr,
        host_port: u16,
        userland_proxy: bool,
    ) -> KeelResult<u16> {
        let port = self.allocator.request(proto, host_ip, host_port)?;
        let rules = policy::port_rules(proto, host_ip, port, container, !userland_proxy);

        if let Err(e) = policy::program_all(&rules, true) {
            self.allocator.release(proto, host_ip, port);
            return Err(e);
        }

        self.mappings.lock().insert((proto, host_ip, port), rules);
        tracing::debug!(%proto, %host_ip, port, %container, "Port forwarding installed");
        Ok(port)
    }

    fn unmap(&self, proto: Protocol, host_ip: IpAddr, host_port: u16) -> KeelResult<()> {
        let rules = self
            .mappings
            .lock()
            .remove(&(proto, host_ip, host_port))
            .ok_or_else(|| KeelError::PortNotMapped {
                proto: proto.to_string(),
                host_ip: host_ip.to_string(),
                port: host_port,
            })?;

        let mut result = Ok(());
        for rule in &rules {
            if let Err(e) = policy::program(rule, false) {
                tracing::warn!(%rule, error = %e, "Failed to remove port forwarding rule");
                result = Err(e);
            }
        }
        self.allocator.release(proto, host_ip, host_port);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::MemoryPortMapper;
    use serde_json::json;

    fn any() -> IpAddr {
        "0.0.0.0".parse().unwrap()
    }

    #[test]
    fn binding_wire_format() {
        let binding: PortBinding =
            serde_json::from_value(json!({"Proto": "tcp", "Port": 80, "HostPort": 8080})).unwrap();
        assert_eq!(binding, PortBinding::tcp(80, 8080));

        let binding = PortBinding::udp(53, 0).with_host_ip("127.0.0.1".parse().unwrap());
        let value = serde_json::to_value(&binding).unwrap();
        assert_eq!(
            value,
            json!({"Proto": "udp", "Port": 53, "HostIP": "127.0.0.1", "HostPort": 0})
        );
    }

    #[test]
    fn protocol_parse_and_display() {
        assert_eq!("TCP".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!(Protocol::Udp.to_string(), "udp");
        assert!("sctp".parse::<Protocol>().is_err());
    }

    #[test]
    fn allocator_explicit_and_dynamic() {
        let alloc = PortAllocator::with_range(40000, 40002);
        assert_eq!(alloc.request(Protocol::Tcp, any(), 8080).unwrap(), 8080);
        assert!(matches!(
            alloc.request(Protocol::Tcp, any(), 8080),
            Err(KeelError::PortAlreadyAllocated { port: 8080, .. })
        ));
        // Same port, other protocol.
        assert_eq!(alloc.request(Protocol::Udp, any(), 8080).unwrap(), 8080);

        assert_eq!(alloc.request(Protocol::Tcp, any(), 0).unwrap(), 40000);
        assert_eq!(alloc.request(Protocol::Tcp, any(), 0).unwrap(), 40001);
        assert_eq!(alloc.request(Protocol::Tcp, any(), 0).unwrap(), 40002);
        assert!(matches!(
            alloc.request(Protocol::Tcp, any(), 0),
            Err(KeelError::NoAvailablePorts { .. })
        ));

        alloc.release(Protocol::Tcp, any(), 40001);
        alloc.release(Protocol::Tcp, any(), 40001);
        assert_eq!(alloc.request(Protocol::Tcp, any(), 0).unwrap(), 40001);
    }

    #[test]
    fn reversed_range_is_swapped() {
        let alloc = PortAllocator::with_range(40001, 40000);
        assert_eq!(alloc.request(Protocol::Tcp, any(), 0).unwrap(), 40000);
        assert_eq!(alloc.request(Protocol::Tcp, any(), 0).unwrap(), 40001);
        assert!(alloc.request(Protocol::Tcp, any(), 0).is_err());
    }

    #[test]
    fn allocate_fills_container_and_host_addresses() {
        let mapper = MemoryPortMapper::new();
        let container: IpAddr = "172.18.0.2".parse().unwrap();
        let requested = vec![PortBinding::tcp(80, 8080), PortBinding::udp(53, 0)];

        let mapped = allocate_ports(&mapper, &requested, container, any(), true).unwrap();
        assert_eq!(mapped.len(), 2);
        assert_eq!(mapped[0].ip, Some(container));
        assert_eq!(mapped[0].host_ip, Some(any()));
        assert_eq!(mapped[0].host_port, 8080);
        assert_eq!(mapped[1].host_port, DYNAMIC_PORT_START);
        assert_eq!(mapper.mapping_count(), 2);

        release_ports(&mapper, &mapped).unwrap();
        assert_eq!(mapper.mapping_count(), 0);
    }

    #[test]
    fn allocate_failure_releases_earlier_bindings() {
        let mapper = MemoryPortMapper::new();
        let container: IpAddr = "172.18.0.2".parse().unwrap();
        let requested = vec![PortBinding::tcp(80, 8080), PortBinding::tcp(81, 8080)];

        let err = allocate_ports(&mapper, &requested, container, any(), true).unwrap_err();
        assert!(matches!(err, KeelError::PortAlreadyAllocated { port: 8080, .. }));
        assert_eq!(mapper.mapping_count(), 0);
    }

    #[test]
    fn release_reports_last_error() {
        let mapper = MemoryPortMapper::new();
        let mut binding = PortBinding::tcp(80, 9999);
        binding.host_ip = Some(any());
        let err = release_ports(&mapper, &[binding]).unwrap_err();
        assert!(matches!(err, KeelError::PortNotMapped { port: 9999, .. }));
    }
}
