//! Setup pipeline failure handling.

use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use keel_bridge::fake::{FakeHost, MemoryPortMapper};
use keel_bridge::{AddressSpace, Collaborators, CurrentNamespace, Driver, IpAllocator};
use keel_common::options::from_json;
use keel_common::{Disposition, KeelError, KeelResult, NetworkId};
use serde_json::json;

/// Allocator whose range registration always fails.
#[derive(Default)]
struct NoRanges {
    inner: AddressSpace,
}

impl IpAllocator for NoRanges {
    fn register_subnet(&self, network: IpNet, _subnet: IpNet) -> KeelResult<()> {
        Err(KeelError::internal(format!("cannot register a range in {network}")))
    }

    fn unregister_subnet(&self, network: IpNet) -> KeelResult<()> {
        self.inner.unregister_subnet(network)
    }

    fn request_ip(&self, network: IpNet, preferred: Option<IpAddr>) -> KeelResult<IpAddr> {
        self.inner.request_ip(network, preferred)
    }

    fn release_ip(&self, network: IpNet, ip: IpAddr) -> KeelResult<()> {
        self.inner.release_ip(network, ip)
    }
}

#[test_log::test]
fn failure_stops_later_steps_and_cleanup_undoes_earlier_ones() {
    let host = Arc::new(FakeHost::new());
    let ipam = Arc::new(NoRanges::default());
    let driver = Driver::new(Collaborators {
        provisioner: host.clone(),
        ipam: ipam.clone(),
        port_mapper: Arc::new(MemoryPortMapper::new()),
        os_context: Arc::new(CurrentNamespace),
    });

    let options = from_json(json!({
        "io.keel.network.generic": {
            "BridgeName": "br0",
            "AllowNonDefaultBridge": true,
            "AddressIPv4": "172.18.0.1/16",
            "FixedCIDR": "172.18.1.0/24",
            "EnableIPv6": true,
            "DefaultGatewayIPv4": "172.18.1.254",
        }
    }))
    .unwrap();

    let id = NetworkId::new("net1").unwrap();
    let err = driver.create_network(&id, &options).unwrap_err();
    assert_eq!(err.disposition(), Disposition::RolledBack);
    assert!(matches!(err.root(), KeelError::Internal { .. }));

    // Steps before the failure ran.
    assert!(host.saw("create_bridge br0"));
    assert!(host.saw("add_address br0 172.18.0.1/16"));
    assert!(host.saw("add_address br0 fe80::1/64"));

    // Steps after it did not.
    assert!(!host.saw("set_link_up"));
    assert!(!host.saw("set_nat_rules"));
    assert!(!ipam.inner.is_allocated(
        "172.18.0.0/16".parse().unwrap(),
        "172.18.1.254".parse().unwrap()
    ));

    // Cleanup removed the device the pipeline created.
    let events = host.events();
    let created = events.iter().position(|e| e == "create_bridge br0").unwrap();
    let deleted = events.iter().position(|e| e == "delete_link br0").unwrap();
    assert!(deleted > created);
    assert!(host.link("br0").is_none());
    assert!(driver.networks().is_empty());

    // The id is free again.
    assert!(driver.network(&id).is_err());
}

#[test_log::test]
fn pre_existing_bridge_survives_failed_setup() {
    let host = Arc::new(FakeHost::new());
    host.add_bridge("br0", &["172.18.0.1/16".parse().unwrap()]);
    host.fail_on("track_firewall_reload");

    let driver = Driver::new(Collaborators {
        provisioner: host.clone(),
        ipam: Arc::new(AddressSpace::new()),
        port_mapper: Arc::new(MemoryPortMapper::new()),
        os_context: Arc::new(CurrentNamespace),
    });
    let options = from_json(json!({
        "io.keel.network.generic": {"BridgeName": "br0", "AddressIPv4": "172.18.0.1/16"}
    }))
    .unwrap();

    let id = NetworkId::new("net1").unwrap();
    let err = driver.create_network(&id, &options).unwrap_err();
    assert_eq!(err.disposition(), Disposition::RolledBack);

    assert!(host.link("br0").is_some());
    assert!(!host.saw("create_bridge"));
    assert!(!host.saw("delete_link"));
    assert!(host.rules().is_empty());

    host.clear_failures();
    driver.create_network(&id, &options).unwrap();
    assert!(driver.bridge(&id).unwrap().pre_existing);
}

#[test_log::test]
fn failed_setup_restores_addresses_of_pre_existing_bridge() {
    let host = Arc::new(FakeHost::new());
    let original: IpNet = "192.168.1.1/24".parse().unwrap();
    host.add_bridge("br0", &[original]);
    host.fail_on("track_firewall_reload");

    let driver = Driver::new(Collaborators {
        provisioner: host.clone(),
        ipam: Arc::new(AddressSpace::new()),
        port_mapper: Arc::new(MemoryPortMapper::new()),
        os_context: Arc::new(CurrentNamespace),
    });
    let options = from_json(json!({
        "io.keel.network.generic": {
            "BridgeName": "br0",
            "AddressIPv4": "172.18.0.1/16",
            "EnableIPv6": true,
        }
    }))
    .unwrap();

    let err = driver
        .create_network(&NetworkId::new("net1").unwrap(), &options)
        .unwrap_err();
    assert_eq!(err.disposition(), Disposition::RolledBack);

    // The device was readdressed before the failure and is put back.
    assert!(host.saw("del_address br0 192.168.1.1/24"));
    assert!(host.saw("add_address br0 172.18.0.1/16"));
    assert_eq!(host.link("br0").unwrap().addresses, vec![original]);
    assert!(!host.saw("delete_link"));
}
