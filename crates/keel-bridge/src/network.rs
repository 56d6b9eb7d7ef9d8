//! Bridge networks and their endpoint registries.

use std::sync::Arc;

use keel_common::{EndpointId, KeelError, KeelResult, NetworkId};
use parking_lot::Mutex;

use crate::config::{ContainerConfig, NetworkConfig};
use crate::conflict::NetworkSnapshot;
use crate::endpoint::BridgeEndpoint;
use crate::interface::BridgeInterface;
use crate::portmap::PortMapper;
use crate::provision::{LinkRule, Provisioner};
use crate::registry::Registry;

struct NetworkState {
    bridge: BridgeInterface,
    endpoints: Registry<EndpointId, BridgeEndpoint>,
    retired: bool,
}

/// A bridge network.
///
/// The bridge reference and the endpoint registry sit behind one lock; it
/// is only held for lookups and registry changes.
pub struct BridgeNetwork {
    id: NetworkId,
    config: Arc<NetworkConfig>,
    port_mapper: Arc<dyn PortMapper>,
    state: Mutex<NetworkState>,
}

impl std::fmt::Debug for BridgeNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BridgeNetwork")
            .field("id", &self.id)
            .field("bridge", &state.bridge.name)
            .field("endpoints", &state.endpoints.len())
            .field("retired", &state.retired)
            .finish_non_exhaustive()
    }
}

impl BridgeNetwork {
    pub(crate) fn new(
        id: NetworkId,
        config: Arc<NetworkConfig>,
        bridge: BridgeInterface,
        port_mapper: Arc<dyn PortMapper>,
    ) -> Self {
        Self {
            id,
            config,
            port_mapper,
            state: Mutex::new(NetworkState {
                bridge,
                endpoints: Registry::new(),
                retired: false,
            }),
        }
    }

    /// Network id.
    #[must_use]
    pub const fn id(&self) -> &NetworkId {
        &self.id
    }

    /// Configuration the network was created with.
    #[must_use]
    pub fn config(&self) -> Arc<NetworkConfig> {
        Arc::clone(&self.config)
    }

    /// Copy of the bridge reference.
    #[must_use]
    pub fn bridge(&self) -> BridgeInterface {
        self.state.lock().bridge.clone()
    }

    /// Conflict-check view of the network.
    #[must_use]
    pub fn snapshot(&self) -> NetworkSnapshot {
        let state = self.state.lock();
        NetworkSnapshot {
            id: self.id.clone(),
            config: Arc::clone(&self.config),
            bridge_name: state.bridge.name.clone(),
            bridge_ipv4: state.bridge.bridge_ipv4,
        }
    }

    /// A committed endpoint.
    #[must_use]
    pub fn endpoint(&self, id: &EndpointId) -> Option<Arc<BridgeEndpoint>> {
        self.state.lock().endpoints.get(id)
    }

    /// Ids of committed and in-flight endpoints.
    #[must_use]
    pub fn endpoint_ids(&self) -> Vec<EndpointId> {
        self.state.lock().endpoints.keys()
    }

    /// Whether `id` is registered, committed or in flight.
    #[must_use]
    pub fn has_endpoint(&self, id: &EndpointId) -> bool {
        self.state.lock().endpoints.contains(id)
    }

    pub(crate) fn port_mapper(&self) -> &dyn PortMapper {
        &*self.port_mapper
    }

    pub(crate) fn set_bridge(&self, bridge: BridgeInterface) {
        self.state.lock().bridge = bridge;
    }

    /// Stop recording isolation against `peer`. Returns the bridge name if
    /// the network was isolated from it.
    pub(crate) fn forget_isolation_peer(&self, peer: &str) -> Option<String> {
        let mut state = self.state.lock();
        let peers = &mut state.bridge.applied.isolated_from;
        let before = peers.len();
        peers.retain(|p| p != peer);
        (peers.len() != before).then(|| state.bridge.name.clone())
    }

    /// Claim `id` for an endpoint being created.
    pub(crate) fn reserve_endpoint(&self, id: &EndpointId) -> KeelResult<()> {
        let mut state = self.state.lock();
        if state.retired {
            return Err(KeelError::not_found(format!(
                "network {} is being deleted",
                self.id
            )));
        }
        if !state.endpoints.reserve(id.clone(), None) {
            return Err(KeelError::EndpointExists { id: id.to_string() });
        }
        Ok(())
    }

    pub(crate) fn commit_endpoint(&self, endpoint: Arc<BridgeEndpoint>) {
        let id = endpoint.id().clone();
        if !self.state.lock().endpoints.commit(&id, endpoint) {
            tracing::warn!(network = %self.id, endpoint = %id, "Endpoint reservation was lost");
        }
    }

    pub(crate) fn abandon_endpoint(&self, id: &EndpointId) {
        self.state.lock().endpoints.abandon(id);
    }

    pub(crate) fn take_endpoint(&self, id: &EndpointId) -> Option<Arc<BridgeEndpoint>> {
        self.state.lock().endpoints.take(id)
    }

    /// Mark the network as going away if it has no endpoints. New endpoint
    /// reservations fail afterwards.
    pub(crate) fn retire_if_idle(&self) -> bool {
        let mut state = self.state.lock();
        if !state.endpoints.is_empty() {
            return false;
        }
        state.retired = true;
        true
    }

    pub(crate) fn reinstate(&self) {
        self.state.lock().retired = false;
    }

    /// Resolve the link rules for `endpoint` joining with `links`.
    ///
    /// Parents may reach the endpoint's exposed ports; the endpoint may
    /// reach each child's exposed ports.
    pub(crate) fn resolve_links(
        &self,
        endpoint: &BridgeEndpoint,
        links: &ContainerConfig,
    ) -> KeelResult<Vec<LinkRule>> {
        let lookup = |id: &EndpointId| {
            self.endpoint(id)
                .ok_or_else(|| KeelError::InvalidEndpointId { id: id.to_string() })
        };

        let mut rules = Vec::new();
        for parent_id in &links.parent_endpoints {
            let parent = lookup(parent_id)?;
            if endpoint.config.exposed_ports.is_empty() {
                continue;
            }
            rules.push(LinkRule {
                parent: parent.addr.addr().into(),
                child: endpoint.addr.addr().into(),
                ports: endpoint.config.exposed_ports.clone(),
            });
        }
        for child_id in &links.child_endpoints {
            let child = lookup(child_id)?;
            if child.config.exposed_ports.is_empty() {
                continue;
            }
            rules.push(LinkRule {
                parent: endpoint.addr.addr().into(),
                child: child.addr.addr().into(),
                ports: child.config.exposed_ports.clone(),
            });
        }
        Ok(rules)
    }
}

/// Install or remove link rules on `bridge`.
///
/// Installing is all or nothing: if one rule fails, those installed before
/// it are removed again. Removing attempts every rule.
///
/// # Errors
///
/// Returns the failing rule's error, the last one when removing.
pub(crate) fn program_links(
    provisioner: &dyn Provisioner,
    bridge: &str,
    links: &[LinkRule],
    enable: bool,
) -> KeelResult<()> {
    if enable {
        for (i, link) in links.iter().enumerate() {
            if let Err(e) = provisioner.set_link_rules(bridge, link, true) {
                for done in links[..i].iter().rev() {
                    if let Err(undo) = provisioner.set_link_rules(bridge, done, false) {
                        tracing::warn!(bridge, error = %undo, "Failed to remove link rule");
                    }
                }
                return Err(e);
            }
        }
        return Ok(());
    }

    let mut last_err = None;
    for link in links {
        if let Err(e) = provisioner.set_link_rules(bridge, link, false) {
            tracing::warn!(bridge, parent = %link.parent, child = %link.child, error = %e, "Failed to remove link rule");
            last_err = Some(e);
        }
    }
    last_err.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;
    use crate::fake::{FakeHost, MemoryPortMapper};
    use crate::interface::Applied;
    use crate::portmap::{Protocol, TransportPort};

    fn network() -> BridgeNetwork {
        let bridge = BridgeInterface {
            name: "br0".to_string(),
            pre_existing: false,
            bridge_ipv4: Some("172.18.0.1/16".parse().unwrap()),
            bridge_ipv6: None,
            gateway_ipv4: None,
            gateway_ipv6: None,
            applied: Applied::default(),
        };
        BridgeNetwork::new(
            NetworkId::new("net1").unwrap(),
            Arc::new(NetworkConfig::default()),
            bridge,
            Arc::new(MemoryPortMapper::new()),
        )
    }

    fn endpoint(id: &str, host: u8, exposed: &[u16]) -> Arc<BridgeEndpoint> {
        Arc::new(BridgeEndpoint {
            id: EndpointId::new(id).unwrap(),
            host_name: format!("vethh{host}"),
            sandbox_name: format!("veths{host}"),
            addr: format!("172.18.0.{host}/16").parse().unwrap(),
            addr_v6: None,
            mac: crate::netutils::generate_mac(std::net::Ipv4Addr::new(172, 18, 0, host)),
            config: EndpointConfig {
                exposed_ports: exposed
                    .iter()
                    .map(|&port| TransportPort {
                        proto: Protocol::Tcp,
                        port,
                    })
                    .collect(),
                ..EndpointConfig::default()
            },
            port_mapping: Vec::new(),
            attachment: Mutex::new(None),
        })
    }

    fn eid(s: &str) -> EndpointId {
        EndpointId::new(s).unwrap()
    }

    #[test]
    fn reservation_blocks_duplicates() {
        let net = network();
        net.reserve_endpoint(&eid("ep1")).unwrap();
        assert!(matches!(
            net.reserve_endpoint(&eid("ep1")),
            Err(KeelError::EndpointExists { .. })
        ));
        assert!(net.has_endpoint(&eid("ep1")));
        assert!(net.endpoint(&eid("ep1")).is_none());

        net.commit_endpoint(endpoint("ep1", 2, &[]));
        assert!(net.endpoint(&eid("ep1")).is_some());
    }

    #[test]
    fn retired_network_refuses_endpoints() {
        let net = network();
        assert!(net.retire_if_idle());
        assert!(net.reserve_endpoint(&eid("ep1")).is_err());
        net.reinstate();
        assert!(net.reserve_endpoint(&eid("ep1")).is_ok());
        assert!(!net.retire_if_idle());
    }

    #[test]
    fn links_follow_exposed_ports() {
        let net = network();
        for ep in [endpoint("web", 2, &[80]), endpoint("db", 3, &[5432]), endpoint("cli", 4, &[])] {
            net.reserve_endpoint(ep.id()).unwrap();
            net.commit_endpoint(ep);
        }
        let web = net.endpoint(&eid("web")).unwrap();
        let links = ContainerConfig {
            parent_endpoints: vec![eid("cli")],
            child_endpoints: vec![eid("db")],
        };
        let rules = net.resolve_links(&web, &links).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].parent.to_string(), "172.18.0.4");
        assert_eq!(rules[0].child.to_string(), "172.18.0.2");
        assert_eq!(rules[0].ports[0].port, 80);
        assert_eq!(rules[1].parent.to_string(), "172.18.0.2");
        assert_eq!(rules[1].child.to_string(), "172.18.0.3");
        assert_eq!(rules[1].ports[0].port, 5432);

        let unknown = ContainerConfig {
            parent_endpoints: vec![eid("ghost")],
            child_endpoints: Vec::new(),
        };
        assert!(matches!(
            net.resolve_links(&web, &unknown),
            Err(KeelError::InvalidEndpointId { .. })
        ));
    }

    #[test]
    fn failed_link_install_removes_earlier_rules() {
        let host = FakeHost::new();
        let first = LinkRule {
            parent: "172.18.0.4".parse().unwrap(),
            child: "172.18.0.2".parse().unwrap(),
            ports: vec![TransportPort {
                proto: Protocol::Tcp,
                port: 80,
            }],
        };
        program_links(&host, "br0", std::slice::from_ref(&first), true).unwrap();
        assert_eq!(host.rules().len(), 1);
        program_links(&host, "br0", &[first], false).unwrap();
        assert!(host.rules().is_empty());

        host.fail_on("set_link_rules");
        let rule = LinkRule {
            parent: "172.18.0.2".parse().unwrap(),
            child: "172.18.0.3".parse().unwrap(),
            ports: Vec::new(),
        };
        assert!(program_links(&host, "br0", &[rule], true).is_err());
        assert!(host.rules().is_empty());
    }
}
