//! The bridge driver: network and endpoint lifecycle.
//!
//! Registry updates follow a two-phase pattern. A create reserves its id
//! under the lock, provisions the host with no lock held, then commits the
//! entry or abandons the reservation. A delete removes the entry first and
//! puts it back if the host changes fail. Locks are taken driver first,
//! network second, and never held while the host is being changed.

use std::net::IpAddr;
use std::sync::Arc;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use keel_common::{EndpointId, KeelError, KeelResult, NetworkId, Options};
use parking_lot::Mutex;

use crate::config::{
    DEFAULT_BRIDGE_NAME, DriverConfig, EndpointConfig, NetworkConfig, parse_container_options,
    parse_driver_config, parse_endpoint_options, parse_network_options,
};
use crate::conflict::{NetworkSnapshot, check_config_conflicts, check_network_conflicts};
use crate::endpoint::{
    Attachment, BridgeEndpoint, CONTAINER_IFACE_PREFIX, EndpointInfo, EndpointOperInfo, IFACE_ID,
    InterfaceInfo, JoinInfo,
};
use crate::host::HostProvisioner;
use crate::interface::BridgeInterface;
use crate::ipam::{AddressSpace, IpAllocator};
use crate::netns::{HostNamespace, NamespaceGuard, OsContext};
use crate::network::{BridgeNetwork, program_links};
use crate::netutils::{elect_mac, generate_iface_name, ipv6_from_mac};
use crate::portmap::{IptablesPortMapper, PortBinding, PortMapper, allocate_ports, release_ports};
use crate::provision::Provisioner;
use crate::registry::Registry;
use crate::setup::{BridgeSetup, SetupEnv};
use crate::steps::elect_bridge_ipv4;

/// Type name the driver registers under.
pub const NETWORK_TYPE: &str = "bridge";

const VETH_PREFIX: &str = "veth";
const VETH_LEN: usize = 7;

/// Services the driver delegates to.
#[derive(Clone)]
pub struct Collaborators {
    /// Host network changes.
    pub provisioner: Arc<dyn Provisioner>,
    /// Address allocation.
    pub ipam: Arc<dyn IpAllocator>,
    /// Host port forwarding.
    pub port_mapper: Arc<dyn PortMapper>,
    /// Namespace switching around host changes.
    pub os_context: Arc<dyn OsContext>,
}

impl Collaborators {
    /// Collaborators acting on the real host.
    #[must_use]
    pub fn host() -> Self {
        Self {
            provisioner: Arc::new(HostProvisioner::new()),
            ipam: Arc::new(AddressSpace::new()),
            port_mapper: Arc::new(IptablesPortMapper::new()),
            os_context: Arc::new(HostNamespace),
        }
    }
}

/// Bridge network driver.
pub struct Driver {
    config: Mutex<Option<Arc<DriverConfig>>>,
    networks: Mutex<Registry<NetworkId, BridgeNetwork>>,
    collab: Collaborators,
}

impl Driver {
    /// A driver with no networks.
    #[must_use]
    pub fn new(collab: Collaborators) -> Self {
        Self {
            config: Mutex::new(None),
            networks: Mutex::new(Registry::new()),
            collab,
        }
    }

    /// Type name of this driver.
    #[must_use]
    pub const fn network_type(&self) -> &'static str {
        NETWORK_TYPE
    }

    /// Apply the driver-wide configuration. Only the first call succeeds.
    ///
    /// # Errors
    ///
    /// [`KeelError::ConfigExists`] on a second call,
    /// [`KeelError::InvalidDriverConfig`] on malformed options, or the
    /// failure to turn on IP forwarding.
    pub fn configure(&self, options: &Options) -> KeelResult<()> {
        if self.config.lock().is_some() {
            return Err(KeelError::ConfigExists);
        }
        let config = parse_driver_config(options)?;

        if config.enable_ip_forwarding {
            let _ns = self.enter_host()?;
            self.collab.provisioner.set_sysctl("net.ipv4.ip_forward", "1")?;
        }

        let mut slot = self.config.lock();
        if slot.is_some() {
            return Err(KeelError::ConfigExists);
        }
        tracing::info!(ip_forwarding = config.enable_ip_forwarding, "Driver configured");
        *slot = Some(Arc::new(config));
        Ok(())
    }

    /// Ids of the committed networks.
    #[must_use]
    pub fn networks(&self) -> Vec<NetworkId> {
        self.networks
            .lock()
            .values()
            .iter()
            .map(|n| n.id().clone())
            .collect()
    }

    /// A committed network.
    ///
    /// # Errors
    ///
    /// [`KeelError::NotFound`] if there is no such network.
    pub fn network(&self, id: &NetworkId) -> KeelResult<Arc<BridgeNetwork>> {
        self.networks
            .lock()
            .get(id)
            .ok_or_else(|| KeelError::not_found(format!("network {id} does not exist")))
    }

    /// The bridge reference of a committed network.
    ///
    /// # Errors
    ///
    /// [`KeelError::NotFound`] if there is no such network.
    pub fn bridge(&self, id: &NetworkId) -> KeelResult<BridgeInterface> {
        Ok(self.network(id)?.bridge())
    }

    /// Create a network and its bridge.
    ///
    /// # Errors
    ///
    /// Fails with [`KeelError::Forbidden`] if the id is taken or the network
    /// conflicts with another one, with a configuration error for bad
    /// options, or with [`KeelError::RolledBack`] if host setup failed and
    /// was undone.
    pub fn create_network(&self, id: &NetworkId, options: &Options) -> KeelResult<()> {
        if self.networks.lock().contains(id) {
            return Err(KeelError::forbidden(format!("network {id} exists")));
        }

        let config = parse_network_options(options)?;
        check_config_conflicts(id, &config, &self.snapshots())?;

        let (mut bridge, routes) = {
            let _ns = self.enter_host()?;
            let bridge = BridgeInterface::resolve(&config, &*self.collab.provisioner)?;
            let routes = if bridge.bridge_ipv4.is_none() {
                self.collab.provisioner.routes_v4()?
            } else {
                Vec::new()
            };
            (bridge, routes)
        };
        let config = Arc::new(config);

        // Pick, check and claim the bridge address in one critical section.
        let (network, peers) = {
            let mut networks = self.networks.lock();
            let peers: Vec<NetworkSnapshot> = networks
                .all_values()
                .iter()
                .map(|n| n.snapshot())
                .collect();
            if bridge.bridge_ipv4.is_none() {
                let taken: Vec<Ipv4Net> = peers.iter().filter_map(|p| p.bridge_ipv4).collect();
                bridge.bridge_ipv4 = Some(elect_bridge_ipv4(&routes, &taken)?);
            }
            check_network_conflicts(id, &bridge.name, bridge.bridge_ipv4, &peers)?;
            let network = Arc::new(BridgeNetwork::new(
                id.clone(),
                Arc::clone(&config),
                bridge.clone(),
                Arc::clone(&self.collab.port_mapper),
            ));
            if !networks.reserve(id.clone(), Some(Arc::clone(&network))) {
                return Err(KeelError::forbidden(format!("network {id} exists")));
            }
            (network, peers)
        };

        match self.setup_bridge(&config, &mut bridge, &peers) {
            Ok(()) => {
                network.set_bridge(bridge.clone());
                self.networks.lock().commit(id, network);
                tracing::info!(
                    network = %id,
                    bridge = %bridge.name,
                    address = ?bridge.bridge_ipv4,
                    "Network created"
                );
                Ok(())
            }
            Err(e) => {
                self.unwind_bridge(&mut bridge);
                self.networks.lock().abandon(id);
                tracing::warn!(network = %id, error = %e, "Network creation rolled back");
                Err(KeelError::rolled_back("create network", e))
            }
        }
    }

    fn setup_bridge(
        &self,
        config: &NetworkConfig,
        bridge: &mut BridgeInterface,
        peers: &[NetworkSnapshot],
    ) -> KeelResult<()> {
        let driver = self.driver_config();
        let env = SetupEnv {
            provisioner: &*self.collab.provisioner,
            ipam: &*self.collab.ipam,
            driver: &driver,
            peer_bridges: peers.iter().map(|p| p.bridge_name.clone()).collect(),
            taken_subnets: peers.iter().filter_map(|p| p.bridge_ipv4).collect(),
        };
        let setup = BridgeSetup::for_network(config, &driver, bridge);

        let _ns = self.enter_host()?;
        setup.apply(&env, config, bridge)
    }

    fn unwind_bridge(&self, bridge: &mut BridgeInterface) {
        let _ns = self.enter_host_or_warn();
        bridge.unwind(&*self.collab.provisioner, &*self.collab.ipam);
    }

    /// Delete a network and tear down its bridge.
    ///
    /// # Errors
    ///
    /// [`KeelError::InternalMaskable`] for an unknown id,
    /// [`KeelError::Forbidden`] for the default network,
    /// [`KeelError::ActiveEndpoints`] while endpoints remain, or
    /// [`KeelError::RolledBack`] if the network could not be detached from
    /// its peers and was restored.
    pub fn delete_network(&self, id: &NetworkId) -> KeelResult<()> {
        let network = {
            let mut networks = self.networks.lock();
            let Some(network) = networks.get(id) else {
                return Err(KeelError::InternalMaskable {
                    message: format!("network {id} does not exist"),
                });
            };
            if network.bridge().name == DEFAULT_BRIDGE_NAME {
                return Err(KeelError::forbidden(format!(
                    "network {id} uses the default bridge and cannot be deleted"
                )));
            }

            networks.take(id);
            if !network.retire_if_idle() {
                networks.restore(id.clone(), Arc::clone(&network));
                return Err(KeelError::ActiveEndpoints {
                    network: id.to_string(),
                });
            }
            network
        };

        let mut bridge = network.bridge();
        let ns = self.enter_host_or_warn();
        if let Err(e) = bridge.remove_isolation(&*self.collab.provisioner) {
            drop(ns);
            network.reinstate();
            if !self.networks.lock().restore(id.clone(), Arc::clone(&network)) {
                tracing::warn!(network = %id, "Network id was reused, not restoring");
            }
            return Err(KeelError::rolled_back("delete network", e));
        }
        bridge.unwind(&*self.collab.provisioner, &*self.collab.ipam);
        self.drop_isolation_against(&bridge.name);
        drop(ns);
        network.set_bridge(bridge);

        tracing::info!(network = %id, "Network deleted");
        Ok(())
    }

    /// Remove the isolation rules other networks hold against a bridge that
    /// is going away. Failures are logged.
    fn drop_isolation_against(&self, gone: &str) {
        let networks: Vec<Arc<BridgeNetwork>> = self.networks.lock().all_values();
        let peer = [gone.to_string()];
        for network in networks {
            let Some(bridge) = network.forget_isolation_peer(gone) else {
                continue;
            };
            if let Err(e) = self.collab.provisioner.set_isolation_rules(&bridge, &peer, false) {
                tracing::warn!(bridge = %bridge, peer = gone, error = %e, "Failed to remove isolation rules");
            }
        }
    }

    /// Create an endpoint: a veth pair attached to the network's bridge,
    /// its addresses and its port bindings.
    ///
    /// # Errors
    ///
    /// [`KeelError::BadRequest`] if `info` already lists interfaces,
    /// [`KeelError::NotFound`] for an unknown network,
    /// [`KeelError::EndpointExists`] for a taken id, a configuration error
    /// for bad options, or [`KeelError::RolledBack`] if provisioning failed
    /// and was undone.
    pub fn create_endpoint(
        &self,
        nid: &NetworkId,
        eid: &EndpointId,
        info: &mut EndpointInfo,
        options: &Options,
    ) -> KeelResult<()> {
        if !info.interfaces().is_empty() {
            return Err(KeelError::bad_request(
                "endpoint interfaces must be assigned by the bridge driver",
            ));
        }
        let network = self.network(nid)?;
        if network.has_endpoint(eid) {
            return Err(KeelError::EndpointExists { id: eid.to_string() });
        }
        let ep_config = parse_endpoint_options(options)?;
        network.reserve_endpoint(eid)?;

        let result = self.enter_host().and_then(|_ns| {
            let mut undo = EndpointUndo::default();
            let result = self.provision_endpoint(&network, eid, ep_config, &mut undo);
            if result.is_err() {
                undo.run(&self.collab, network.port_mapper());
            }
            result
        });

        match result {
            Ok(endpoint) => {
                let endpoint = Arc::new(endpoint);
                network.commit_endpoint(Arc::clone(&endpoint));
                info.add_interface(InterfaceInfo {
                    id: IFACE_ID,
                    mac: endpoint.mac,
                    address: endpoint.addr,
                    address_v6: endpoint.addr_v6,
                })?;
                tracing::info!(
                    network = %nid,
                    endpoint = %eid,
                    address = %endpoint.addr,
                    mac = %endpoint.mac,
                    "Endpoint created"
                );
                Ok(())
            }
            Err(e) => {
                network.abandon_endpoint(eid);
                tracing::warn!(network = %nid, endpoint = %eid, error = %e, "Endpoint creation rolled back");
                Err(KeelError::rolled_back("create endpoint", e))
            }
        }
    }

    fn provision_endpoint(
        &self,
        network: &BridgeNetwork,
        eid: &EndpointId,
        ep_config: EndpointConfig,
        undo: &mut EndpointUndo,
    ) -> KeelResult<BridgeEndpoint> {
        let prov = &*self.collab.provisioner;
        let ipam = &*self.collab.ipam;
        let config = network.config();
        let bridge = network.bridge();

        let host_name = generate_iface_name(VETH_PREFIX, VETH_LEN, |n| prov.link_exists(n))?;
        let sandbox_name = generate_iface_name(VETH_PREFIX, VETH_LEN, |n| {
            Ok(n == host_name || prov.link_exists(n)?)
        })?;
        prov.create_veth(&host_name, &sandbox_name)?;
        undo.veth = Some(host_name.clone());

        if config.mtu > 0 {
            let mtu = config.mtu.unsigned_abs();
            prov.set_mtu(&host_name, mtu)?;
            prov.set_mtu(&sandbox_name, mtu)?;
        }
        prov.set_master(&host_name, &bridge.name)?;

        let subnet = bridge.bridge_ipv4.ok_or_else(|| {
            KeelError::internal(format!("bridge {} has no IPv4 address", bridge.name))
        })?;
        let network_v4 = IpNet::V4(subnet.trunc());
        let ip = ipam.request_ip(network_v4, None)?;
        undo.v4 = Some((network_v4, ip));
        let IpAddr::V4(ip4) = ip else {
            return Err(KeelError::internal(format!("{ip} is not an IPv4 address")));
        };
        let addr = Ipv4Net::new(ip4, subnet.prefix_len())
            .map_err(|e| KeelError::internal(e.to_string()))?;

        let mac = elect_mac(ep_config.mac_address, ip4);
        prov.set_link_down(&sandbox_name)?;
        prov.set_hw_addr(&sandbox_name, mac)?;

        let addr_v6 = if config.enable_ipv6 {
            let range = config.fixed_cidr_v6.or(bridge.bridge_ipv6).ok_or_else(|| {
                KeelError::internal(format!("bridge {} has no IPv6 network", bridge.name))
            })?;
            let network_v6 = IpNet::V6(range.trunc());
            let preferred = ipv6_from_mac(range, mac).map(IpAddr::V6);
            let ip6 = ipam.request_ip(network_v6, preferred)?;
            undo.v6 = Some((network_v6, ip6));
            let IpAddr::V6(ip6) = ip6 else {
                return Err(KeelError::internal(format!("{ip6} is not an IPv6 address")));
            };
            Some(
                Ipv6Net::new(ip6, range.prefix_len())
                    .map_err(|e| KeelError::internal(e.to_string()))?,
            )
        } else {
            None
        };

        prov.set_link_up(&host_name)?;

        let port_mapping = allocate_ports(
            network.port_mapper(),
            &ep_config.port_bindings,
            ip,
            config.default_binding_ip,
            config.enable_userland_proxy,
        )?;
        undo.ports.clone_from(&port_mapping);

        Ok(BridgeEndpoint {
            id: eid.clone(),
            host_name,
            sandbox_name,
            addr,
            addr_v6,
            mac,
            config: ep_config,
            port_mapping,
            attachment: Mutex::new(None),
        })
    }

    /// Delete an endpoint and release what it holds.
    ///
    /// Once the endpoint is removed every release is attempted; failures are
    /// logged and do not stop the delete.
    ///
    /// # Errors
    ///
    /// [`KeelError::NotFound`] for an unknown network or
    /// [`KeelError::EndpointNotFound`] for an unknown endpoint.
    pub fn delete_endpoint(&self, nid: &NetworkId, eid: &EndpointId) -> KeelResult<()> {
        let network = self.network(nid)?;
        let endpoint = network
            .take_endpoint(eid)
            .ok_or_else(|| KeelError::EndpointNotFound { id: eid.to_string() })?;

        let ns = self.enter_host_or_warn();
        if let Err(e) = release_ports(network.port_mapper(), &endpoint.port_mapping) {
            tracing::warn!(endpoint = %eid, error = %e, "Failed to release endpoint ports");
        }

        let mut addresses = vec![(IpNet::V4(endpoint.addr.trunc()), IpAddr::V4(endpoint.addr.addr()))];
        if let Some(v6) = endpoint.addr_v6 {
            addresses.push((IpNet::V6(v6.trunc()), IpAddr::V6(v6.addr())));
        }
        for (net, ip) in addresses {
            if let Err(e) = self.collab.ipam.release_ip(net, ip) {
                tracing::warn!(endpoint = %eid, address = %ip, error = %e, "Failed to release endpoint address");
            }
        }

        match self.collab.provisioner.delete_link(&endpoint.host_name) {
            Err(e) if !e.is_link_not_found() => {
                tracing::warn!(endpoint = %eid, link = %endpoint.host_name, error = %e, "Failed to delete veth");
            }
            _ => {}
        }
        drop(ns);

        tracing::info!(network = %nid, endpoint = %eid, "Endpoint deleted");
        Ok(())
    }

    /// Operational data of an endpoint.
    ///
    /// # Errors
    ///
    /// [`KeelError::NotFound`] for an unknown network or
    /// [`KeelError::EndpointNotFound`] for an unknown endpoint.
    pub fn endpoint_oper_info(
        &self,
        nid: &NetworkId,
        eid: &EndpointId,
    ) -> KeelResult<EndpointOperInfo> {
        Ok(self.endpoint(nid, eid)?.1.oper_info())
    }

    /// Join an endpoint to a sandbox.
    ///
    /// Fills in the interface names and gateways. With ICC off, installs the
    /// link rules for the parent and child endpoints named in `options`.
    ///
    /// # Errors
    ///
    /// Lookup errors, [`KeelError::InvalidEndpointId`] for an unknown link
    /// peer, [`KeelError::Forbidden`] if the endpoint is already joined, or
    /// [`KeelError::RolledBack`] if the link rules could not be installed.
    pub fn join(
        &self,
        nid: &NetworkId,
        eid: &EndpointId,
        sandbox_key: &str,
        join_info: &mut JoinInfo,
        options: &Options,
    ) -> KeelResult<()> {
        let (network, endpoint) = self.endpoint(nid, eid)?;
        let config = network.config();
        let bridge = network.bridge();
        let container_config = parse_container_options(options)?;

        let links = match &container_config {
            Some(links) if !config.enable_icc => network.resolve_links(&endpoint, links)?,
            _ => Vec::new(),
        };
        endpoint.attach(Attachment {
            sandbox_key: sandbox_key.to_string(),
            container_config,
            links: links.clone(),
        })?;

        if !links.is_empty() {
            let _ns = self.enter_host()?;
            if let Err(e) = program_links(&*self.collab.provisioner, &bridge.name, &links, true) {
                endpoint.detach();
                return Err(KeelError::rolled_back("join", e));
            }
        }

        join_info.set_names(IFACE_ID, &endpoint.sandbox_name, CONTAINER_IFACE_PREFIX);
        join_info.gateway_v4 = bridge.gateway_ipv4;
        join_info.gateway_v6 = if config.enable_ipv6 {
            bridge.gateway_ipv6
        } else {
            None
        };

        tracing::info!(network = %nid, endpoint = %eid, sandbox = sandbox_key, links = links.len(), "Endpoint joined");
        Ok(())
    }

    /// Detach an endpoint from its sandbox, removing its link rules.
    ///
    /// Leaving an endpoint that is not joined does nothing.
    ///
    /// # Errors
    ///
    /// Lookup errors, or the failure to remove a link rule. The endpoint
    /// stays joined then.
    pub fn leave(&self, nid: &NetworkId, eid: &EndpointId) -> KeelResult<()> {
        let (network, endpoint) = self.endpoint(nid, eid)?;
        let Some(attachment) = endpoint.detach() else {
            tracing::debug!(network = %nid, endpoint = %eid, "Endpoint is not joined");
            return Ok(());
        };

        if !attachment.links.is_empty() {
            let bridge = network.bridge();
            let _ns = self.enter_host()?;
            if let Err(e) =
                program_links(&*self.collab.provisioner, &bridge.name, &attachment.links, false)
            {
                if let Err(reattach) = endpoint.attach(attachment) {
                    tracing::warn!(endpoint = %eid, error = %reattach, "Could not restore the attachment after a failed leave");
                }
                return Err(e);
            }
        }

        tracing::info!(network = %nid, endpoint = %eid, "Endpoint left");
        Ok(())
    }

    fn endpoint(
        &self,
        nid: &NetworkId,
        eid: &EndpointId,
    ) -> KeelResult<(Arc<BridgeNetwork>, Arc<BridgeEndpoint>)> {
        let network = self.network(nid)?;
        let endpoint = network
            .endpoint(eid)
            .ok_or_else(|| KeelError::EndpointNotFound { id: eid.to_string() })?;
        Ok((network, endpoint))
    }

    fn snapshots(&self) -> Vec<NetworkSnapshot> {
        self.networks
            .lock()
            .all_values()
            .iter()
            .map(|n| n.snapshot())
            .collect()
    }

    fn driver_config(&self) -> Arc<DriverConfig> {
        self.config.lock().clone().unwrap_or_default()
    }

    fn enter_host(&self) -> KeelResult<NamespaceGuard> {
        self.collab.os_context.enter()
    }

    /// Enter the host namespace for best-effort work, carrying on in the
    /// current one if that fails.
    fn enter_host_or_warn(&self) -> NamespaceGuard {
        self.enter_host().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to enter host network namespace");
            NamespaceGuard::noop()
        })
    }
}

/// Endpoint resources acquired so far, released newest first on failure.
#[derive(Default)]
struct EndpointUndo {
    veth: Option<String>,
    v4: Option<(IpNet, IpAddr)>,
    v6: Option<(IpNet, IpAddr)>,
    ports: Vec<PortBinding>,
}

impl EndpointUndo {
    fn run(&self, collab: &Collaborators, mapper: &dyn PortMapper) {
        if let Err(e) = release_ports(mapper, &self.ports) {
            tracing::warn!(error = %e, "Failed to release ports");
        }
        for (net, ip) in [self.v6, self.v4].into_iter().flatten() {
            if let Err(e) = collab.ipam.release_ip(net, ip) {
                tracing::warn!(%ip, error = %e, "Failed to release address");
            }
        }
        if let Some(veth) = &self.veth {
            match collab.provisioner.delete_link(veth) {
                Err(e) if !e.is_link_not_found() => {
                    tracing::warn!(link = %veth, error = %e, "Failed to delete veth");
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeHost, MemoryPortMapper};
    use crate::netns::CurrentNamespace;
    use keel_common::{Disposition, ErrorKind, labels};
    use serde_json::json;

    struct Harness {
        host: Arc<FakeHost>,
        ipam: Arc<AddressSpace>,
        ports: Arc<MemoryPortMapper>,
        driver: Driver,
    }

    fn harness() -> Harness {
        let host = Arc::new(FakeHost::new());
        let ipam = Arc::new(AddressSpace::new());
        let ports = Arc::new(MemoryPortMapper::new());
        let driver = Driver::new(Collaborators {
            provisioner: host.clone(),
            ipam: ipam.clone(),
            port_mapper: ports.clone(),
            os_context: Arc::new(CurrentNamespace),
        });
        Harness {
            host,
            ipam,
            ports,
            driver,
        }
    }

    fn options(generic: serde_json::Value) -> Options {
        let mut options = Options::new();
        options.insert(labels::GENERIC_DATA.to_string(), generic);
        options
    }

    fn nid(s: &str) -> NetworkId {
        NetworkId::new(s).unwrap()
    }

    fn eid(s: &str) -> EndpointId {
        EndpointId::new(s).unwrap()
    }

    fn br0() -> Options {
        options(json!({
            "BridgeName": "br0",
            "AddressIPv4": "172.18.0.1/16",
            "AllowNonDefaultBridge": true,
        }))
    }

    #[test_log::test]
    fn configure_once() {
        let h = harness();
        let opts = options(json!({"EnableIPForwarding": true}));
        h.driver.configure(&opts).unwrap();
        assert_eq!(h.host.sysctl("net.ipv4.ip_forward").as_deref(), Some("1"));
        assert!(matches!(
            h.driver.configure(&opts),
            Err(KeelError::ConfigExists)
        ));
    }

    #[test_log::test]
    fn create_endpoint_assigns_address_and_mac() {
        let h = harness();
        h.driver.create_network(&nid("net1"), &br0()).unwrap();

        let mut info = EndpointInfo::new();
        h.driver
            .create_endpoint(&nid("net1"), &eid("ep1"), &mut info, &Options::new())
            .unwrap();

        let iface = &info.interfaces()[0];
        assert_eq!(iface.id, IFACE_ID);
        assert_eq!(iface.address.to_string(), "172.18.0.2/16");
        assert_eq!(iface.mac.to_string(), "02:42:ac:12:00:02");

        let (_, ep) = h.driver.endpoint(&nid("net1"), &eid("ep1")).unwrap();
        let host_end = h.host.link(ep.host_name()).unwrap();
        assert_eq!(host_end.master.as_deref(), Some("br0"));
        assert!(host_end.up);
        assert_eq!(h.host.link(ep.sandbox_name()).unwrap().mac, Some(iface.mac));
    }

    #[test_log::test]
    fn create_endpoint_rejects_prefilled_info() {
        let h = harness();
        h.driver.create_network(&nid("net1"), &br0()).unwrap();

        let mut info = EndpointInfo::new();
        info.add_interface(InterfaceInfo {
            id: IFACE_ID,
            mac: "02:42:00:00:00:01".parse().unwrap(),
            address: "10.0.0.2/24".parse().unwrap(),
            address_v6: None,
        })
        .unwrap();
        let err = h
            .driver
            .create_endpoint(&nid("net1"), &eid("ep1"), &mut info, &Options::new())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
        assert!(!h.driver.network(&nid("net1")).unwrap().has_endpoint(&eid("ep1")));
    }

    #[test_log::test]
    fn endpoint_failure_releases_everything() {
        let h = harness();
        h.driver.create_network(&nid("net1"), &br0()).unwrap();
        let links_before = h.host.link_names();

        h.host.fail_on("set_link_up");
        let opts = {
            let mut o = Options::new();
            o.insert(
                labels::PORT_MAP.to_string(),
                json!([{"Proto": "tcp", "Port": 80, "HostPort": 8080}]),
            );
            o
        };
        let err = h
            .driver
            .create_endpoint(&nid("net1"), &eid("ep1"), &mut EndpointInfo::new(), &opts)
            .unwrap_err();
        assert_eq!(err.disposition(), Disposition::RolledBack);

        assert_eq!(h.host.link_names(), links_before);
        assert!(!h.ipam.is_allocated(
            "172.18.0.0/16".parse().unwrap(),
            "172.18.0.2".parse().unwrap()
        ));
        assert_eq!(h.ports.mapping_count(), 0);
        assert!(!h.driver.network(&nid("net1")).unwrap().has_endpoint(&eid("ep1")));
    }

    #[test_log::test]
    fn delete_endpoint_releases_ports_and_address() {
        let h = harness();
        h.driver.create_network(&nid("net1"), &br0()).unwrap();
        let mut opts = Options::new();
        opts.insert(
            labels::PORT_MAP.to_string(),
            json!([{"Proto": "tcp", "Port": 80, "HostPort": 8080}]),
        );
        h.driver
            .create_endpoint(&nid("net1"), &eid("ep1"), &mut EndpointInfo::new(), &opts)
            .unwrap();
        assert_eq!(h.ports.mapping_count(), 1);

        let oper = h.driver.endpoint_oper_info(&nid("net1"), &eid("ep1")).unwrap();
        assert_eq!(oper.port_bindings[0].host_port, 8080);

        h.driver.delete_endpoint(&nid("net1"), &eid("ep1")).unwrap();
        assert_eq!(h.ports.mapping_count(), 0);
        assert!(matches!(
            h.driver.delete_endpoint(&nid("net1"), &eid("ep1")),
            Err(KeelError::EndpointNotFound { .. })
        ));
    }

    #[test_log::test]
    fn delete_network_is_gated_on_isolation_removal() {
        let h = harness();
        h.driver.create_network(&nid("net1"), &br0()).unwrap();
        let second = options(json!({
            "BridgeName": "br1",
            "AddressIPv4": "172.19.0.1/16",
            "AllowNonDefaultBridge": true,
        }));
        h.driver.create_network(&nid("net2"), &second).unwrap();
        assert!(h.host.rules().contains(&"isolate br1 br0".to_string()));

        h.host.fail_on("set_isolation_rules");
        let err = h.driver.delete_network(&nid("net2")).unwrap_err();
        assert_eq!(err.disposition(), Disposition::RolledBack);
        assert!(h.driver.network(&nid("net2")).is_ok());
        assert!(h.host.link("br1").is_some());

        h.host.clear_failures();
        h.driver.delete_network(&nid("net2")).unwrap();
        assert!(h.driver.network(&nid("net2")).is_err());
        assert!(h.host.link("br1").is_none());
    }

    #[test_log::test]
    fn delete_unknown_network_is_maskable() {
        let h = harness();
        let err = h.driver.delete_network(&nid("ghost")).unwrap_err();
        assert!(err.is_maskable());
    }
}
