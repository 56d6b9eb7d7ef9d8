//! Endpoints: one container's attachment to a bridge network.

use std::net::{Ipv4Addr, Ipv6Addr};

use ipnet::{Ipv4Net, Ipv6Net};
use keel_common::{EndpointId, KeelError, KeelResult, Options, labels};
use parking_lot::Mutex;

use crate::config::{ContainerConfig, EndpointConfig};
use crate::netutils::MacAddr;
use crate::portmap::{PortBinding, TransportPort};
use crate::provision::LinkRule;

/// Interface id this driver assigns to the endpoint's only interface.
pub const IFACE_ID: usize = 1;

/// Name prefix of the interface inside the sandbox.
pub const CONTAINER_IFACE_PREFIX: &str = "eth";

/// Join-time state of an endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attachment {
    /// Sandbox the endpoint was joined to.
    pub sandbox_key: String,
    /// Link configuration passed at join.
    pub container_config: Option<ContainerConfig>,
    /// Link rules installed at join.
    pub links: Vec<LinkRule>,
}

/// A provisioned endpoint.
#[derive(Debug)]
pub struct BridgeEndpoint {
    pub(crate) id: EndpointId,
    pub(crate) host_name: String,
    pub(crate) sandbox_name: String,
    pub(crate) addr: Ipv4Net,
    pub(crate) addr_v6: Option<Ipv6Net>,
    pub(crate) mac: MacAddr,
    pub(crate) config: EndpointConfig,
    pub(crate) port_mapping: Vec<PortBinding>,
    pub(crate) attachment: Mutex<Option<Attachment>>,
}

impl BridgeEndpoint {
    /// Endpoint id.
    #[must_use]
    pub const fn id(&self) -> &EndpointId {
        &self.id
    }

    /// Host-side veth name.
    #[must_use]
    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    /// Sandbox-side veth name.
    #[must_use]
    pub fn sandbox_name(&self) -> &str {
        &self.sandbox_name
    }

    /// IPv4 address and prefix.
    #[must_use]
    pub const fn addr(&self) -> Ipv4Net {
        self.addr
    }

    /// IPv6 address and prefix, when IPv6 is enabled.
    #[must_use]
    pub const fn addr_v6(&self) -> Option<Ipv6Net> {
        self.addr_v6
    }

    /// Hardware address.
    #[must_use]
    pub const fn mac(&self) -> MacAddr {
        self.mac
    }

    /// Endpoint configuration as requested.
    #[must_use]
    pub const fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Port bindings as resolved.
    #[must_use]
    pub fn port_mapping(&self) -> &[PortBinding] {
        &self.port_mapping
    }

    /// Join-time state, if joined.
    pub fn attachment(&self) -> Option<Attachment> {
        self.attachment.lock().clone()
    }

    /// Record a join. Fails if the endpoint is already joined.
    pub(crate) fn attach(&self, attachment: Attachment) -> KeelResult<()> {
        let mut slot = self.attachment.lock();
        if let Some(current) = slot.as_ref() {
            return Err(KeelError::forbidden(format!(
                "endpoint {} is already joined to sandbox {}",
                self.id, current.sandbox_key
            )));
        }
        *slot = Some(attachment);
        Ok(())
    }

    /// Clear and return the join state.
    pub(crate) fn detach(&self) -> Option<Attachment> {
        self.attachment.lock().take()
    }

    /// Read-only projection for inspection.
    #[must_use]
    pub fn oper_info(&self) -> EndpointOperInfo {
        EndpointOperInfo {
            mac: self.mac,
            exposed_ports: self.config.exposed_ports.clone(),
            port_bindings: self.port_mapping.clone(),
        }
    }
}

/// An interface the driver created for an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    /// Interface id.
    pub id: usize,
    /// Hardware address.
    pub mac: MacAddr,
    /// IPv4 address and prefix.
    pub address: Ipv4Net,
    /// IPv6 address and prefix.
    pub address_v6: Option<Ipv6Net>,
}

/// Interfaces of an endpoint, filled in by the driver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointInfo {
    interfaces: Vec<InterfaceInfo>,
}

impl EndpointInfo {
    /// No interfaces yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interfaces added so far.
    #[must_use]
    pub fn interfaces(&self) -> &[InterfaceInfo] {
        &self.interfaces
    }

    /// Add an interface.
    ///
    /// # Errors
    ///
    /// Fails if an interface with the same id exists.
    pub fn add_interface(&mut self, iface: InterfaceInfo) -> KeelResult<()> {
        if self.interfaces.iter().any(|i| i.id == iface.id) {
            return Err(KeelError::bad_request(format!(
                "interface {} already added",
                iface.id
            )));
        }
        self.interfaces.push(iface);
        Ok(())
    }
}

/// Names an interface takes inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceNames {
    /// Interface id.
    pub id: usize,
    /// Current name of the interface on the host.
    pub src_name: String,
    /// Prefix for its name inside the sandbox.
    pub dst_prefix: String,
}

/// Join result filled in by the driver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinInfo {
    /// Interface naming, one entry per interface.
    pub interface_names: Vec<InterfaceNames>,
    /// IPv4 default gateway.
    pub gateway_v4: Option<Ipv4Addr>,
    /// IPv6 default gateway.
    pub gateway_v6: Option<Ipv6Addr>,
}

impl JoinInfo {
    /// Set the names for interface `id`, replacing earlier ones.
    pub fn set_names(&mut self, id: usize, src_name: &str, dst_prefix: &str) {
        let names = InterfaceNames {
            id,
            src_name: src_name.to_string(),
            dst_prefix: dst_prefix.to_string(),
        };
        match self.interface_names.iter_mut().find(|n| n.id == id) {
            Some(slot) => *slot = names,
            None => self.interface_names.push(names),
        }
    }

    /// Names set for interface `id`.
    #[must_use]
    pub fn names(&self, id: usize) -> Option<&InterfaceNames> {
        self.interface_names.iter().find(|n| n.id == id)
    }
}

/// Copies of an endpoint's operational data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointOperInfo {
    /// Hardware address.
    pub mac: MacAddr,
    /// Exposed ports.
    pub exposed_ports: Vec<TransportPort>,
    /// Resolved port bindings.
    pub port_bindings: Vec<PortBinding>,
}

impl EndpointOperInfo {
    /// The same data keyed by the well-known labels.
    ///
    /// # Errors
    ///
    /// Fails only if a value cannot be serialized.
    pub fn to_options(&self) -> KeelResult<Options> {
        let mut options = Options::new();
        options.insert(labels::MAC_ADDRESS.to_string(), serde_json::to_value(self.mac)?);
        options.insert(
            labels::EXPOSED_PORTS.to_string(),
            serde_json::to_value(&self.exposed_ports)?,
        );
        options.insert(
            labels::PORT_MAP.to_string(),
            serde_json::to_value(&self.port_bindings)?,
        );
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portmap::Protocol;
    use serde_json::json;

    fn endpoint() -> BridgeEndpoint {
        BridgeEndpoint {
            id: EndpointId::new("ep1").unwrap(),
            host_name: "veth1234567".to_string(),
            sandbox_name: "veth7654321".to_string(),
            addr: "172.18.0.2/16".parse().unwrap(),
            addr_v6: None,
            mac: "02:42:ac:12:00:02".parse().unwrap(),
            config: EndpointConfig {
                exposed_ports: vec![TransportPort {
                    proto: Protocol::Tcp,
                    port: 80,
                }],
                ..EndpointConfig::default()
            },
            port_mapping: vec![PortBinding::tcp(80, 8080)],
            attachment: Mutex::new(None),
        }
    }

    #[test]
    fn oper_info_options() {
        let options = endpoint().oper_info().to_options().unwrap();
        assert_eq!(
            options[labels::MAC_ADDRESS],
            json!("02:42:ac:12:00:02")
        );
        assert_eq!(
            options[labels::EXPOSED_PORTS],
            json!([{"Proto": "tcp", "Port": 80}])
        );
        assert_eq!(
            options[labels::PORT_MAP],
            json!([{"Proto": "tcp", "Port": 80, "HostPort": 8080}])
        );
    }

    #[test]
    fn attach_once() {
        let ep = endpoint();
        let attachment = Attachment {
            sandbox_key: "/var/run/netns/c1".to_string(),
            ..Attachment::default()
        };
        ep.attach(attachment.clone()).unwrap();
        assert!(ep.attach(attachment.clone()).is_err());
        assert_eq!(ep.detach(), Some(attachment));
        assert!(ep.detach().is_none());
    }

    #[test]
    fn join_info_names_replace() {
        let mut info = JoinInfo::default();
        info.set_names(IFACE_ID, "veth0", "eth");
        info.set_names(IFACE_ID, "veth1", "eth");
        assert_eq!(info.interface_names.len(), 1);
        assert_eq!(info.names(IFACE_ID).unwrap().src_name, "veth1");
    }

    #[test]
    fn endpoint_info_rejects_duplicate_ids() {
        let ep = endpoint();
        let iface = InterfaceInfo {
            id: IFACE_ID,
            mac: ep.mac(),
            address: ep.addr(),
            address_v6: None,
        };
        let mut info = EndpointInfo::new();
        info.add_interface(iface.clone()).unwrap();
        assert!(info.add_interface(iface).is_err());
    }
}
