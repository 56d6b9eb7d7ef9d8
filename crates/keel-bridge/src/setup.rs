//! Ordered bridge setup pipeline.
//!
//! A [`BridgeSetup`] is a list of named steps queued in a fixed order, some
//! only when the configuration asks for them. [`BridgeSetup::apply`] runs
//! them in order and stops at the first failure. Steps record their host
//! effects on the [`BridgeInterface`]; undoing them is left to the caller
//! (see [`BridgeInterface::unwind`]).

use ipnet::Ipv4Net;
use keel_common::KeelResult;

use crate::config::{DriverConfig, NetworkConfig};
use crate::interface::BridgeInterface;
use crate::ipam::IpAllocator;
use crate::provision::Provisioner;
use crate::steps;

/// Collaborators and driver state visible to setup steps.
pub struct SetupEnv<'a> {
    /// Host provisioning.
    pub provisioner: &'a dyn Provisioner,
    /// Address allocation.
    pub ipam: &'a dyn IpAllocator,
    /// Driver-wide configuration.
    pub driver: &'a DriverConfig,
    /// Bridge devices of the other networks.
    pub peer_bridges: Vec<String>,
    /// Bridge subnets of the other networks.
    pub taken_subnets: Vec<Ipv4Net>,
}

/// A setup step.
pub type SetupStep = fn(&SetupEnv<'_>, &NetworkConfig, &mut BridgeInterface) -> KeelResult<()>;

/// Queue of named setup steps.
#[derive(Default)]
pub struct BridgeSetup {
    steps: Vec<(&'static str, SetupStep)>,
}

impl BridgeSetup {
    /// An empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The queue for a network:
    ///
    /// 1. create the device, unless it exists
    /// 2. assign the IPv4 address
    /// 3. enable IPv6, if requested
    /// 4. reconcile addresses of a pre-existing device
    /// 5. register the fixed IPv4 range, if any
    /// 6. register the fixed IPv6 range, if any
    /// 7. IPv6 forwarding, if forwarding is on and a fixed IPv6 range is set
    /// 8. loopback routing, unless the userland proxy serves ports
    /// 9. NAT, with iptables
    /// 10. firewall reload tracking, with iptables
    /// 11. default gateways, if configured
    /// 12. isolation from other bridges, with iptables
    /// 13. ICC filtering, with iptables and ICC off
    /// 14. reserve the bridge address
    /// 15. bring the device up
    #[must_use]
    pub fn for_network(
        config: &NetworkConfig,
        driver: &DriverConfig,
        bridge: &BridgeInterface,
    ) -> Self {
        let iptables = config.enable_ip_tables;
        let mut setup = Self::new();

        setup.queue_if(!bridge.pre_existing, "setup_device", steps::setup_device);
        setup.queue_step("setup_bridge_ipv4", steps::setup_bridge_ipv4);
        setup.queue_if(config.enable_ipv6, "setup_bridge_ipv6", steps::setup_bridge_ipv6);
        setup.queue_if(
            bridge.pre_existing,
            "verify_and_reconcile",
            steps::verify_and_reconcile,
        );
        setup.queue_if(
            config.fixed_cidr.is_some(),
            "setup_fixed_cidr_v4",
            steps::setup_fixed_cidr_v4,
        );
        setup.queue_if(
            config.fixed_cidr_v6.is_some(),
            "setup_fixed_cidr_v6",
            steps::setup_fixed_cidr_v6,
        );
        setup.queue_if(
            driver.enable_ip_forwarding && config.fixed_cidr_v6.is_some(),
            "setup_ipv6_forwarding",
            steps::setup_ipv6_forwarding,
        );
        setup.queue_if(
            !config.enable_userland_proxy,
            "setup_loopback_routing",
            steps::setup_loopback_routing,
        );
        setup.queue_if(iptables, "setup_nat", steps::setup_nat);
        setup.queue_if(iptables, "setup_firewall_tracking", steps::setup_firewall_tracking);
        setup.queue_if(
            config.default_gateway_ipv4.is_some(),
            "setup_gateway_ipv4",
            steps::setup_gateway_ipv4,
        );
        setup.queue_if(
            config.default_gateway_ipv6.is_some(),
            "setup_gateway_ipv6",
            steps::setup_gateway_ipv6,
        );
        setup.queue_if(iptables, "setup_isolation", steps::setup_isolation);
        setup.queue_if(
            iptables && !config.enable_icc,
            "setup_icc_filtering",
            steps::setup_icc_filtering,
        );
        setup.queue_step("allocate_bridge_ip", steps::allocate_bridge_ip);
        setup.queue_step("setup_device_up", steps::setup_device_up);

        setup
    }

    /// Append a step.
    pub fn queue_step(&mut self, name: &'static str, step: SetupStep) {
        self.steps.push((name, step));
    }

    /// Append a step when `condition` holds.
    pub fn queue_if(&mut self, condition: bool, name: &'static str, step: SetupStep) {
        if condition {
            self.queue_step(name, step);
        }
    }

    /// Names of the queued steps, in order.
    #[must_use]
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|(name, _)| *name).collect()
    }

    /// Run every step in order, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Returns the error of the failing step. Effects of the steps before it
    /// stay applied and recorded on `bridge`.
    pub fn apply(
        &self,
        env: &SetupEnv<'_>,
        config: &NetworkConfig,
        bridge: &mut BridgeInterface,
    ) -> KeelResult<()> {
        for (name, step) in &self.steps {
            tracing::debug!(bridge = %bridge.name, step = name, "Applying setup step");
            if let Err(e) = step(env, config, bridge) {
                tracing::warn!(bridge = %bridge.name, step = name, error = %e, "Setup step failed");
                return Err(e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeHost;
    use crate::ipam::AddressSpace;
    use keel_common::KeelError;

    fn bridge(pre_existing: bool) -> BridgeInterface {
        BridgeInterface {
            name: "br0".to_string(),
            pre_existing,
            bridge_ipv4: None,
            bridge_ipv6: None,
            gateway_ipv4: None,
            gateway_ipv6: None,
            applied: Default::default(),
        }
    }

    #[test]
    fn default_queue() {
        let setup = BridgeSetup::for_network(
            &NetworkConfig::default(),
            &DriverConfig::default(),
            &bridge(false),
        );
        assert_eq!(
            setup.step_names(),
            [
                "setup_device",
                "setup_bridge_ipv4",
                "setup_loopback_routing",
                "setup_nat",
                "setup_firewall_tracking",
                "setup_isolation",
                "allocate_bridge_ip",
                "setup_device_up",
            ]
        );
    }

    #[test]
    fn full_queue_keeps_documented_order() {
        let config = NetworkConfig {
            enable_ipv6: true,
            fixed_cidr: Some("172.18.1.0/24".parse().unwrap()),
            fixed_cidr_v6: Some("2001:db8::/64".parse().unwrap()),
            default_gateway_ipv4: Some("172.18.1.254".parse().unwrap()),
            default_gateway_ipv6: Some("2001:db8::1".parse().unwrap()),
            enable_icc: false,
            enable_userland_proxy: true,
            ..NetworkConfig::default()
        };
        let driver = DriverConfig {
            enable_ip_forwarding: true,
        };
        let setup = BridgeSetup::for_network(&config, &driver, &bridge(true));
        assert_eq!(
            setup.step_names(),
            [
                "setup_bridge_ipv4",
                "setup_bridge_ipv6",
                "verify_and_reconcile",
                "setup_fixed_cidr_v4",
                "setup_fixed_cidr_v6",
                "setup_ipv6_forwarding",
                "setup_nat",
                "setup_firewall_tracking",
                "setup_gateway_ipv4",
                "setup_gateway_ipv6",
                "setup_isolation",
                "setup_icc_filtering",
                "allocate_bridge_ip",
                "setup_device_up",
            ]
        );
    }

    #[test]
    fn iptables_off_skips_rule_steps() {
        let config = NetworkConfig {
            enable_ip_tables: false,
            enable_icc: false,
            ..NetworkConfig::default()
        };
        let names = BridgeSetup::for_network(&config, &DriverConfig::default(), &bridge(false))
            .step_names();
        assert!(!names.contains(&"setup_nat"));
        assert!(!names.contains(&"setup_isolation"));
        assert!(!names.contains(&"setup_icc_filtering"));
    }

    fn fail(_: &SetupEnv<'_>, _: &NetworkConfig, _: &mut BridgeInterface) -> KeelResult<()> {
        Err(KeelError::internal("step failed"))
    }

    fn mark(_: &SetupEnv<'_>, _: &NetworkConfig, bridge: &mut BridgeInterface) -> KeelResult<()> {
        bridge.applied.registered.push("10.0.0.0/8".parse().unwrap());
        Ok(())
    }

    #[test_log::test]
    fn apply_stops_at_first_failure() {
        let host = FakeHost::new();
        let ipam = AddressSpace::new();
        let driver = DriverConfig::default();
        let env = SetupEnv {
            provisioner: &host,
            ipam: &ipam,
            driver: &driver,
            peer_bridges: Vec::new(),
            taken_subnets: Vec::new(),
        };

        let mut setup = BridgeSetup::new();
        setup.queue_step("first", mark);
        setup.queue_step("broken", fail);
        setup.queue_step("never", mark);

        let mut br = bridge(false);
        let err = setup
            .apply(&env, &NetworkConfig::default(), &mut br)
            .unwrap_err();
        assert!(matches!(err, KeelError::Internal { .. }));
        assert_eq!(br.applied.registered.len(), 1);
    }
}
