//! Typed driver, network, endpoint and container configuration.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{Ipv4Net, Ipv6Net};
use keel_common::options::{decode, flexible_bool, flexible_i32};
use keel_common::{EndpointId, KeelError, KeelResult, OptionModel, Options, labels};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::netutils::{MacAddr, overlaps};
use crate::portmap::{PortBinding, TransportPort};

/// Bridge device used when a network does not name one.
pub const DEFAULT_BRIDGE_NAME: &str = "keel0";

/// Process-wide driver configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriverConfig {
    /// Turn on kernel IP forwarding when the driver is configured.
    #[serde(rename = "EnableIPForwarding", deserialize_with = "flexible_bool")]
    pub enable_ip_forwarding: bool,
}

impl OptionModel for DriverConfig {
    const KEYS: &'static [&'static str] = &["EnableIPForwarding"];
}

/// Per-network configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    /// Bridge device name; empty means [`DEFAULT_BRIDGE_NAME`].
    #[serde(rename = "BridgeName")]
    pub bridge_name: String,
    /// Bridge address and subnet.
    #[serde(rename = "AddressIPv4")]
    pub address_ipv4: Option<Ipv4Net>,
    /// Subnet container addresses are drawn from.
    #[serde(rename = "FixedCIDR")]
    pub fixed_cidr: Option<Ipv4Net>,
    /// IPv6 subnet container addresses are drawn from.
    #[serde(rename = "FixedCIDRv6")]
    pub fixed_cidr_v6: Option<Ipv6Net>,
    /// Give endpoints IPv6 addresses.
    #[serde(rename = "EnableIPv6", deserialize_with = "flexible_bool")]
    pub enable_ipv6: bool,
    /// Program NAT and filter rules.
    #[serde(rename = "EnableIPTables", deserialize_with = "flexible_bool")]
    pub enable_ip_tables: bool,
    /// Masquerade outbound traffic. Needs `EnableIPTables`.
    #[serde(rename = "EnableIPMasquerade", deserialize_with = "flexible_bool")]
    pub enable_ip_masquerade: bool,
    /// Let endpoints of the network talk to each other.
    #[serde(rename = "EnableICC", deserialize_with = "flexible_bool")]
    pub enable_icc: bool,
    /// Endpoint MTU, 0 for the kernel default.
    #[serde(rename = "Mtu", deserialize_with = "flexible_i32")]
    pub mtu: i32,
    /// Gateway handed to endpoints instead of the bridge address.
    #[serde(rename = "DefaultGatewayIPv4")]
    pub default_gateway_ipv4: Option<Ipv4Addr>,
    /// IPv6 gateway handed to endpoints; must lie in `FixedCIDRv6`.
    #[serde(rename = "DefaultGatewayIPv6")]
    pub default_gateway_ipv6: Option<Ipv6Addr>,
    /// Host address published ports bind to by default.
    #[serde(rename = "DefaultBindingIP")]
    pub default_binding_ip: IpAddr,
    /// Allow creating a bridge device with a non-default name.
    #[serde(rename = "AllowNonDefaultBridge", deserialize_with = "flexible_bool")]
    pub allow_non_default_bridge: bool,
    /// Published ports are served by a userland proxy.
    #[serde(rename = "EnableUserlandProxy", deserialize_with = "flexible_bool")]
    pub enable_userland_proxy: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bridge_name: String::new(),
            address_ipv4: None,
            fixed_cidr: None,
            fixed_cidr_v6: None,
            enable_ipv6: false,
            enable_ip_tables: true,
            enable_ip_masquerade: true,
            enable_icc: true,
            mtu: 0,
            default_gateway_ipv4: None,
            default_gateway_ipv6: None,
            default_binding_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            allow_non_default_bridge: false,
            enable_userland_proxy: false,
        }
    }
}

impl OptionModel for NetworkConfig {
    const KEYS: &'static [&'static str] = &[
        "BridgeName",
        "AddressIPv4",
        "FixedCIDR",
        "FixedCIDRv6",
        "EnableIPv6",
        "EnableIPTables",
        "EnableIPMasquerade",
        "EnableICC",
        "Mtu",
        "DefaultGatewayIPv4",
        "DefaultGatewayIPv6",
        "DefaultBindingIP",
        "AllowNonDefaultBridge",
        "EnableUserlandProxy",
    ];
}

impl NetworkConfig {
    /// Check the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns the validation error for the first inconsistency found.
    pub fn validate(&self) -> KeelResult<()> {
        if self.mtu < 0 {
            return Err(KeelError::InvalidMtu { mtu: self.mtu });
        }

        if let (Some(address), Some(fixed)) = (self.address_ipv4, self.fixed_cidr) {
            if !address.trunc().contains(&fixed.trunc()) {
                return Err(KeelError::InvalidContainerSubnet {
                    subnet: fixed.to_string(),
                    network: address.trunc().to_string(),
                });
            }
        }

        if let (Some(gateway), Some(address)) = (self.default_gateway_ipv4, self.address_ipv4) {
            if !address.contains(&gateway) {
                return Err(KeelError::InvalidGateway {
                    gateway: gateway.to_string(),
                    subnet: address.trunc().to_string(),
                });
            }
        }

        if let Some(gateway) = self.default_gateway_ipv6 {
            match self.fixed_cidr_v6 {
                Some(fixed) if fixed.contains(&gateway) => {}
                fixed => {
                    return Err(KeelError::InvalidGateway {
                        gateway: gateway.to_string(),
                        subnet: fixed.map_or_else(|| "an unset FixedCIDRv6".to_string(), |f| f.to_string()),
                    });
                }
            }
        }

        if self.fixed_cidr_v6.is_some() && !self.enable_ipv6 {
            return Err(KeelError::bad_request("FixedCIDRv6 requires EnableIPv6"));
        }

        Ok(())
    }

    /// Whether two configurations cannot coexist: same bridge name (an
    /// unspecified name included) or overlapping explicit bridge subnets.
    #[must_use]
    pub fn conflicts(&self, other: &Self) -> bool {
        if self.bridge_name == other.bridge_name {
            return true;
        }
        match (self.address_ipv4, other.address_ipv4) {
            (Some(a), Some(b)) => overlaps(&a, &b),
            _ => false,
        }
    }

    /// The bridge name with the default substituted.
    #[must_use]
    pub fn effective_bridge_name(&self) -> &str {
        if self.bridge_name.is_empty() {
            DEFAULT_BRIDGE_NAME
        } else {
            &self.bridge_name
        }
    }
}

/// Per-endpoint configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EndpointConfig {
    /// Explicit hardware address.
    #[serde(rename = "MacAddress")]
    pub mac_address: Option<MacAddr>,
    /// Requested host port bindings.
    #[serde(rename = "PortBindings")]
    pub port_bindings: Vec<PortBinding>,
    /// Ports reachable from linked endpoints.
    #[serde(rename = "ExposedPorts")]
    pub exposed_ports: Vec<TransportPort>,
}

impl OptionModel for EndpointConfig {
    const KEYS: &'static [&'static str] = &["MacAddress", "PortBindings", "ExposedPorts"];
}

/// Endpoint links, supplied at join time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContainerConfig {
    /// Endpoints allowed to reach this one.
    #[serde(rename = "ParentEndpoints")]
    pub parent_endpoints: Vec<EndpointId>,
    /// Endpoints this one may reach.
    #[serde(rename = "ChildEndpoints")]
    pub child_endpoints: Vec<EndpointId>,
}

impl OptionModel for ContainerConfig {
    const KEYS: &'static [&'static str] = &["ParentEndpoints", "ChildEndpoints"];
}

fn generic_data(options: &Options) -> KeelResult<Option<&Options>> {
    match options.get(labels::GENERIC_DATA) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(other) => Err(KeelError::InvalidOption {
            key: labels::GENERIC_DATA.to_string(),
            message: format!("expected an object, got {other}"),
        }),
    }
}

/// Decode the driver configuration from its generic data.
///
/// # Errors
///
/// Returns [`KeelError::InvalidDriverConfig`] on malformed options.
pub fn parse_driver_config(options: &Options) -> KeelResult<DriverConfig> {
    let invalid = |e: KeelError| KeelError::InvalidDriverConfig {
        message: e.to_string(),
    };
    match generic_data(options).map_err(invalid)? {
        Some(map) => decode(map).map_err(invalid),
        None => Ok(DriverConfig::default()),
    }
}

/// Decode and validate a network configuration.
///
/// The generic data carries the [`NetworkConfig`] keys; the IPv6 label, if
/// present, overrides `EnableIPv6`.
///
/// # Errors
///
/// Returns a `BadRequest`-kind error naming the offending key or rule.
pub fn parse_network_options(options: &Options) -> KeelResult<NetworkConfig> {
    let mut config = match generic_data(options)? {
        Some(map) => decode::<NetworkConfig>(map)?,
        None => NetworkConfig::default(),
    };

    if let Some(value) = options.get(labels::ENABLE_IPV6) {
        config.enable_ipv6 = value.as_bool().ok_or_else(|| KeelError::InvalidOption {
            key: labels::ENABLE_IPV6.to_string(),
            message: format!("expected a boolean, got {value}"),
        })?;
    }

    config.validate()?;
    Ok(config)
}

/// Decode endpoint options from their well-known labels. Other labels are
/// ignored.
///
/// # Errors
///
/// Returns [`KeelError::InvalidEndpointConfig`] on malformed values.
pub fn parse_endpoint_options(options: &Options) -> KeelResult<EndpointConfig> {
    let mut model = Options::new();
    for (label, key) in [
        (labels::MAC_ADDRESS, "MacAddress"),
        (labels::PORT_MAP, "PortBindings"),
        (labels::EXPOSED_PORTS, "ExposedPorts"),
    ] {
        if let Some(value) = options.get(label) {
            model.insert(key.to_string(), value.clone());
        }
    }

    decode(&model).map_err(|e| KeelError::InvalidEndpointConfig {
        message: e.to_string(),
    })
}

/// Decode the link configuration passed to join, if any.
///
/// # Errors
///
/// Returns [`KeelError::InvalidEndpointConfig`] on malformed values.
pub fn parse_container_options(options: &Options) -> KeelResult<Option<ContainerConfig>> {
    let invalid = |e: KeelError| KeelError::InvalidEndpointConfig {
        message: e.to_string(),
    };
    generic_data(options)
        .map_err(invalid)?
        .map(|map| decode(map).map_err(invalid))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_common::ErrorKind;
    use keel_common::options::from_json;
    use serde_json::json;

    fn network(generic: Value) -> KeelResult<NetworkConfig> {
        parse_network_options(&from_json(json!({ "io.keel.network.generic": generic })).unwrap())
    }

    #[test]
    fn network_defaults() {
        let config = parse_network_options(&Options::new()).unwrap();
        assert!(config.enable_icc);
        assert!(config.enable_ip_tables);
        assert!(config.enable_ip_masquerade);
        assert!(!config.enable_ipv6);
        assert_eq!(config.effective_bridge_name(), DEFAULT_BRIDGE_NAME);
        assert_eq!(config.default_binding_ip, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }

    #[test]
    fn network_from_generic_data() {
        let config = network(json!({
            "BridgeName": "br0",
            "AddressIPv4": "172.18.0.1/16",
            "FixedCIDR": "172.18.1.0/24",
            "EnableICC": "false",
            "Mtu": "1450",
        }))
        .unwrap();
        assert_eq!(config.bridge_name, "br0");
        assert_eq!(config.address_ipv4.unwrap().addr(), Ipv4Addr::new(172, 18, 0, 1));
        assert_eq!(config.address_ipv4.unwrap().prefix_len(), 16);
        assert!(!config.enable_icc);
        assert!(config.enable_ip_tables);
        assert_eq!(config.mtu, 1450);
    }

    #[test]
    fn ipv6_label_overrides_generic_data() {
        let options = from_json(json!({
            "io.keel.network.generic": {"EnableIPv6": false},
            "io.keel.network.enable_ipv6": true,
        }))
        .unwrap();
        assert!(parse_network_options(&options).unwrap().enable_ipv6);

        let options = from_json(json!({ "io.keel.network.enable_ipv6": "yes" })).unwrap();
        let err = parse_network_options(&options).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
    }

    #[test]
    fn malformed_network_fields_are_rejected() {
        let err = network(json!({"BridgeName": "br0", "Colour": "red"})).unwrap_err();
        assert!(matches!(err, KeelError::InvalidOption { ref key, .. } if key == "Colour"));

        let err = network(json!({"AddressIPv4": "172.18.0.1"})).unwrap_err();
        assert!(matches!(err, KeelError::InvalidOption { ref key, .. } if key == "AddressIPv4"));

        let err = network(json!("br0")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
    }

    #[test]
    fn validation_rules() {
        let err = network(json!({"Mtu": -1})).unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"Invalid MTU number: -1");

        let err = network(json!({"AddressIPv4": "172.18.0.1/16", "FixedCIDR": "10.0.0.0/24"}))
            .unwrap_err();
        insta::assert_snapshot!(
            err.to_string(),
            @"Container subnet 10.0.0.0/24 must be a subset of bridge network 172.18.0.0/16"
        );

        let err = network(json!({"AddressIPv4": "172.18.0.1/16", "DefaultGatewayIPv4": "10.0.0.1"}))
            .unwrap_err();
        assert!(matches!(err, KeelError::InvalidGateway { .. }));

        let err = network(json!({"EnableIPv6": true, "DefaultGatewayIPv6": "2001:db8::1"}))
            .unwrap_err();
        assert!(matches!(err, KeelError::InvalidGateway { .. }));

        let err = network(json!({"FixedCIDRv6": "2001:db8::/64"})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);

        network(json!({
            "EnableIPv6": true,
            "FixedCIDRv6": "2001:db8::/64",
            "DefaultGatewayIPv6": "2001:db8::1",
        }))
        .unwrap();
    }

    #[test]
    fn pairwise_conflicts() {
        let a = network(json!({"BridgeName": "br0", "AddressIPv4": "172.18.0.1/16"})).unwrap();
        let same_name = network(json!({"BridgeName": "br0"})).unwrap();
        let overlapping = network(json!({"AddressIPv4": "172.18.5.1/24"})).unwrap();
        let disjoint = network(json!({"BridgeName": "br1", "AddressIPv4": "172.19.0.1/16"})).unwrap();
        let unnamed = NetworkConfig::default();

        assert!(a.conflicts(&same_name));
        assert!(a.conflicts(&overlapping));
        assert!(overlapping.conflicts(&a));
        assert!(!a.conflicts(&disjoint));
        assert!(unnamed.conflicts(&overlapping), "both default to the same bridge");
    }

    #[test]
    fn endpoint_options_from_labels() {
        let options = from_json(json!({
            "io.keel.network.endpoint.macaddress": "02:42:ac:11:00:09",
            "io.keel.network.portmap": [{"Proto": "tcp", "Port": 80, "HostPort": 8080}],
            "io.keel.network.endpoint.exposedports": [{"Proto": "tcp", "Port": 80}],
            "com.example.unrelated": 1,
        }))
        .unwrap();
        let config = parse_endpoint_options(&options).unwrap();
        assert_eq!(config.mac_address.unwrap().to_string(), "02:42:ac:11:00:09");
        assert_eq!(config.port_bindings, vec![PortBinding::tcp(80, 8080)]);
        assert_eq!(config.exposed_ports.len(), 1);

        let options = from_json(json!({ "io.keel.network.endpoint.macaddress": "not-a-mac" })).unwrap();
        let err = parse_endpoint_options(&options).unwrap_err();
        assert!(matches!(err, KeelError::InvalidEndpointConfig { .. }));
    }

    #[test]
    fn driver_and_container_options() {
        let options = from_json(json!({ "io.keel.network.generic": {"EnableIPForwarding": "true"} })).unwrap();
        assert!(parse_driver_config(&options).unwrap().enable_ip_forwarding);
        assert!(!parse_driver_config(&Options::new()).unwrap().enable_ip_forwarding);

        let options = from_json(json!({ "io.keel.network.generic": {"Forwarding": true} })).unwrap();
        assert!(matches!(
            parse_driver_config(&options),
            Err(KeelError::InvalidDriverConfig { .. })
        ));

        assert!(parse_container_options(&Options::new()).unwrap().is_none());
        let options =
            from_json(json!({ "io.keel.network.generic": {"ParentEndpoints": ["ep1"]} })).unwrap();
        let links = parse_container_options(&options).unwrap().unwrap();
        assert_eq!(links.parent_endpoints[0].as_str(), "ep1");
        assert!(links.child_endpoints.is_empty());
    }
}
