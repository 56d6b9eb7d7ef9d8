//! [`Provisioner`] for the real host: `ip(8)`, `iptables(8)` and procfs.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use ipnet::{IpNet, Ipv4Net};
use keel_common::KeelResult;
use parking_lot::Mutex;

use crate::link;
use crate::netutils::MacAddr;
use crate::policy::{self, Rule};
use crate::provision::{LinkAddresses, LinkRule, Provisioner};

const PROC_SYS: &str = "/proc/sys";

/// Rule sets installed for one bridge, keyed by what they are for.
type RuleSets = BTreeMap<String, Vec<Rule>>;

/// Provisioner acting on the host the process runs on.
///
/// Installed rule sets are remembered per bridge so they can be put back
/// with [`HostProvisioner::reload_firewall`] after the firewall has been
/// flushed.
pub struct HostProvisioner {
    sysctl_root: PathBuf,
    installed: Mutex<BTreeMap<String, RuleSets>>,
    tracked: Mutex<BTreeSet<String>>,
}

impl HostProvisioner {
    /// A provisioner writing sysctls under `/proc/sys`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_sysctl_root(PROC_SYS)
    }

    /// A provisioner writing sysctls under `root`.
    #[must_use]
    pub fn with_sysctl_root(root: impl Into<PathBuf>) -> Self {
        Self {
            sysctl_root: root.into(),
            installed: Mutex::new(BTreeMap::new()),
            tracked: Mutex::new(BTreeSet::new()),
        }
    }

    /// Reinstall the rule sets of every tracked bridge.
    ///
    /// # Errors
    ///
    /// Returns the last failure; every bridge is attempted.
    pub fn reload_firewall(&self) -> KeelResult<()> {
        let tracked: Vec<String> = self.tracked.lock().iter().cloned().collect();
        let mut result = Ok(());
        for bridge in tracked {
            let rules: Vec<Rule> = self
                .installed
                .lock()
                .get(&bridge)
                .map(|sets| sets.values().flatten().cloned().collect())
                .unwrap_or_default();
            tracing::info!(bridge = %bridge, rules = rules.len(), "Reloading firewall rules");
            if let Err(e) = policy::program_all(&rules, true) {
                tracing::warn!(bridge = %bridge, error = %e, "Failed to reload firewall rules");
                result = Err(e);
            }
        }
        result
    }

    /// Program a rule set and remember it under `key`.
    fn apply_rules(&self, bridge: &str, key: String, rules: Vec<Rule>, enable: bool) -> KeelResult<()> {
        policy::program_all(&rules, enable)?;
        self.record_rules(bridge, key, rules, enable);
        Ok(())
    }

    fn record_rules(&self, bridge: &str, key: String, rules: Vec<Rule>, enable: bool) {
        let mut installed = self.installed.lock();
        if enable {
            installed.entry(bridge.to_string()).or_default().insert(key, rules);
        } else if let Some(sets) = installed.get_mut(bridge) {
            sets.remove(&key);
            if sets.is_empty() {
                installed.remove(bridge);
            }
        }
    }

    fn sysctl_path(&self, key: &str) -> PathBuf {
        self.sysctl_root.join(key.replace('.', "/"))
    }
}

impl Default for HostProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl Provisioner for HostProvisioner {
    fn link_exists(&self, name: &str) -> KeelResult<bool> {
        link::exists(name)
    }

    fn create_bridge(&self, name: &str) -> KeelResult<()> {
        link::add_bridge(name)
    }

    fn delete_link(&self, name: &str) -> KeelResult<()> {
        link::delete(name)
    }

    fn addresses(&self, name: &str) -> KeelResult<LinkAddresses> {
        link::addresses(name)
    }

    fn add_address(&self, name: &str, address: IpNet) -> KeelResult<()> {
        link::add_address(name, address)
    }

    fn del_address(&self, name: &str, address: IpNet) -> KeelResult<()> {
        link::del_address(name, address)
    }

    fn routes_v4(&self) -> KeelResult<Vec<Ipv4Net>> {
        link::routes_v4()
    }

    fn create_veth(&self, host: &str, peer: &str) -> KeelResult<()> {
        link::add_veth(host, peer)
    }

    fn set_mtu(&self, name: &str, mtu: u32) -> KeelResult<()> {
        link::set(name, &["mtu", &mtu.to_string()])
    }

    fn set_master(&self, name: &str, bridge: &str) -> KeelResult<()> {
        link::set(name, &["master", bridge])
    }

    fn set_hw_addr(&self, name: &str, mac: MacAddr) -> KeelResult<()> {
        link::set_address(name, mac)
    }

    fn set_link_up(&self, name: &str) -> KeelResult<()> {
        link::set(name, &["up"])
    }

    fn set_link_down(&self, name: &str) -> KeelResult<()> {
        link::set(name, &["down"])
    }

    fn set_sysctl(&self, key: &str, value: &str) -> KeelResult<()> {
        let path = self.sysctl_path(key);
        if std::fs::read_to_string(&path).is_ok_and(|current| current.trim() == value) {
            return Ok(());
        }
        std::fs::write(&path, value)?;
        tracing::debug!(key, value, "Set sysctl");
        Ok(())
    }

    fn set_nat_rules(
        &self,
        bridge: &str,
        subnet: Ipv4Net,
        masquerade: bool,
        enable: bool,
    ) -> KeelResult<()> {
        let rules = policy::nat_rules(bridge, subnet, masquerade);
        self.apply_rules(bridge, "nat".to_string(), rules, enable)
    }

    fn set_isolation_rules(&self, bridge: &str, peers: &[String], enable: bool) -> KeelResult<()> {
        policy::program_all(&policy::isolation_rules(bridge, peers), enable)?;
        // One record per peer.
        for peer in peers {
            let rules = policy::isolation_rules(bridge, std::slice::from_ref(peer));
            self.record_rules(bridge, format!("isolation {peer}"), rules, enable);
        }
        Ok(())
    }

    fn set_icc_rules(&self, bridge: &str, enable: bool) -> KeelResult<()> {
        self.apply_rules(bridge, "icc".to_string(), policy::icc_rules(bridge), enable)
    }

    fn set_link_rules(&self, bridge: &str, link: &LinkRule, enable: bool) -> KeelResult<()> {
        let rules = policy::link_rules(bridge, link.parent, link.child, &link.ports);
        let key = format!("link {}->{}", link.parent, link.child);
        self.apply_rules(bridge, key, rules, enable)
    }

    fn track_firewall_reload(&self, bridge: &str, enable: bool) -> KeelResult<()> {
        let mut tracked = self.tracked.lock();
        if enable {
            tracked.insert(bridge.to_string());
        } else {
            tracked.remove(bridge);
        }
        Ok(())
    }
}
