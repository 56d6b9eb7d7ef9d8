//! Packet filter rules and their programming through `iptables(8)`.
//!
//! Rules are plain values built with [`Rule`]; the functions at the bottom
//! of the module produce the rule sets the driver installs for NAT,
//! inter-network isolation, ICC and container links.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::Command;

use ipnet::Ipv4Net;
use keel_common::{KeelError, KeelResult};

use crate::portmap::{Protocol, TransportPort};

/// Comment attached to every rule the driver installs.
pub const RULE_COMMENT: &str = "keel";

/// Netfilter table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// The `filter` table.
    Filter,
    /// The `nat` table.
    Nat,
}

impl Table {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Filter => "filter",
            Self::Nat => "nat",
        }
    }
}

/// Rule verdict.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// Let the packet through.
    Accept,
    /// Silently discard.
    Drop,
    /// Source NAT to the outgoing interface address.
    Masquerade,
    /// Destination NAT to a container address.
    Dnat(SocketAddr),
}

/// A single iptables rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    table: Table,
    chain: String,
    matches: Vec<String>,
    target: Target,
    /// Insert at the head of the chain instead of appending.
    insert: bool,
}

impl Rule {
    /// A rule in the `filter` table.
    pub fn filter(chain: &str, target: Target) -> Self {
        Self::new(Table::Filter, chain, target)
    }

    /// A rule in the `nat` table.
    pub fn nat(chain: &str, target: Target) -> Self {
        Self::new(Table::Nat, chain, target)
    }

    fn new(table: Table, chain: &str, target: Target) -> Self {
        Self {
            table,
            chain: chain.to_string(),
            matches: Vec::new(),
            target,
            insert: false,
        }
    }

    fn arg(mut self, flag: &str, value: impl fmt::Display) -> Self {
        self.matches.push(flag.to_string());
        self.matches.push(value.to_string());
        self
    }

    /// Match the input interface.
    #[must_use]
    pub fn in_iface(self, name: &str) -> Self {
        self.arg("-i", name)
    }

    /// Match the output interface.
    #[must_use]
    pub fn out_iface(self, name: &str) -> Self {
        self.arg("-o", name)
    }

    /// Match anything but the output interface.
    #[must_use]
    pub fn not_out_iface(mut self, name: &str) -> Self {
        self.matches.push("!".to_string());
        self.arg("-o", name)
    }

    /// Match the source address or subnet.
    #[must_use]
    pub fn source(self, source: impl fmt::Display) -> Self {
        self.arg("-s", source)
    }

    /// Match the destination address or subnet.
    #[must_use]
    pub fn destination(self, destination: impl fmt::Display) -> Self {
        self.arg("-d", destination)
    }

    /// Match the transport protocol.
    #[must_use]
    pub fn protocol(self, proto: Protocol) -> Self {
        self.arg("-p", proto)
    }

    /// Match the destination port. Requires [`Rule::protocol`].
    #[must_use]
    pub fn dport(self, port: u16) -> Self {
        self.arg("--dport", port)
    }

    /// Match the source port. Requires [`Rule::protocol`].
    #[must_use]
    pub fn sport(self, port: u16) -> Self {
        self.arg("--sport", port)
    }

    /// Match established and related connections.
    #[must_use]
    pub fn established(self) -> Self {
        self.arg("-m", "conntrack")
            .arg("--ctstate", "RELATED,ESTABLISHED")
    }

    /// Insert the rule at the head of its chain.
    #[must_use]
    pub const fn first(mut self) -> Self {
        self.insert = true;
        self
    }

    /// Render the command line for `op` (`-A`, `-I`, `-D` or `-C`).
    #[must_use]
    pub fn to_args(&self, op: &str) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            self.table.as_str().to_string(),
            op.to_string(),
            self.chain.clone(),
        ];
        args.extend(self.matches.iter().cloned());
        args.extend(
            ["-m", "comment", "--comment", RULE_COMMENT]
                .iter()
                .map(ToString::to_string),
        );
        args.push("-j".to_string());
        match &self.target {
            Target::Accept => args.push("ACCEPT".to_string()),
            Target::Drop => args.push("DROP".to_string()),
            Target::Masquerade => args.push("MASQUERADE".to_string()),
            Target::Dnat(dest) => {
                args.push("DNAT".to_string());
                args.push("--to-destination".to_string());
                args.push(dest.to_string());
            }
        }
        args
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = if self.insert { "-I" } else { "-A" };
        write!(f, "{}", self.to_args(op).join(" "))
    }
}

/// Run `iptables` with `args`, returning whether it exited successfully.
fn run(args: &[String]) -> KeelResult<(bool, String)> {
    let output = Command::new("iptables")
        .arg("--wait")
        .args(args)
        .output()
        .map_err(|e| KeelError::CommandFailed {
            command: "iptables".to_string(),
            message: e.to_string(),
        })?;

    Ok((
        output.status.success(),
        String::from_utf8_lossy(&output.stderr).trim().to_string(),
    ))
}

/// Whether `rule` is currently installed.
///
/// # Errors
///
/// Fails if `iptables` cannot be executed.
pub fn exists(rule: &Rule) -> KeelResult<bool> {
    run(&rule.to_args("-C")).map(|(ok, _)| ok)
}

/// Install (`enable`) or remove a rule.
///
/// A rule already in the desired state is left alone.
///
/// # Errors
///
/// Returns [`KeelError::CommandFailed`] if `iptables` rejects the change.
pub fn program(rule: &Rule, enable: bool) -> KeelResult<()> {
    if exists(rule)? == enable {
        return Ok(());
    }

    let op = match (enable, rule.insert) {
        (false, _) => "-D",
        (true, true) => "-I",
        (true, false) => "-A",
    };
    let args = rule.to_args(op);
    let (ok, stderr) = run(&args)?;
    if !ok {
        return Err(KeelError::CommandFailed {
            command: format!("iptables {}", args.join(" ")),
            message: stderr,
        });
    }

    tracing::debug!(%rule, enable, "Programmed iptables rule");
    Ok(())
}

/// Program a whole rule set. On an enable failure the rules already
/// installed by this call are removed again.
///
/// # Errors
///
/// Returns the first failure.
pub fn program_all(rules: &[Rule], enable: bool) -> KeelResult<()> {
    for (idx, rule) in rules.iter().enumerate() {
        if let Err(e) = program(rule, enable) {
            if enable {
                for installed in rules[..idx].iter().rev() {
                    if let Err(undo) = program(installed, false) {
                        tracing::warn!(rule = %installed, error = %undo, "Failed to remove rule");
                    }
                }
            }
            return Err(e);
        }
    }
    Ok(())
}

/// Outbound NAT and forwarding for a bridge subnet.
#[must_use]
pub fn nat_rules(bridge: &str, subnet: Ipv4Net, masquerade: bool) -> Vec<Rule> {
    let mut rules = Vec::with_capacity(3);
    if masquerade {
        rules.push(
            Rule::nat("POSTROUTING", Target::Masquerade)
                .source(subnet.trunc())
                .not_out_iface(bridge),
        );
    }
    rules.push(
        Rule::filter("FORWARD", Target::Accept)
            .in_iface(bridge)
            .not_out_iface(bridge),
    );
    rules.push(
        Rule::filter("FORWARD", Target::Accept)
            .out_iface(bridge)
            .established(),
    );
    rules
}

/// Drop traffic between `bridge` and every peer bridge, both directions.
#[must_use]
pub fn isolation_rules(bridge: &str, peers: &[String]) -> Vec<Rule> {
    peers
        .iter()
        .flat_map(|peer| {
            [
                Rule::filter("FORWARD", Target::Drop)
                    .in_iface(bridge)
                    .out_iface(peer)
                    .first(),
                Rule::filter("FORWARD", Target::Drop)
                    .in_iface(peer)
                    .out_iface(bridge)
                    .first(),
            ]
        })
        .collect()
}

/// Drop traffic between endpoints of the same bridge.
#[must_use]
pub fn icc_rules(bridge: &str) -> Vec<Rule> {
    vec![
        Rule::filter("FORWARD", Target::Drop)
            .in_iface(bridge)
            .out_iface(bridge),
    ]
}

/// Let `parent` reach `child` on `ports`, and the replies back.
#[must_use]
pub fn link_rules(bridge: &str, parent: IpAddr, child: IpAddr, ports: &[TransportPort]) -> Vec<Rule> {
    ports
        .iter()
        .flat_map(|tp| {
            [
                Rule::filter("FORWARD", Target::Accept)
                    .in_iface(bridge)
                    .out_iface(bridge)
                    .protocol(tp.proto)
                    .source(parent)
                    .destination(child)
                    .dport(tp.port)
                    .first(),
                Rule::filter("FORWARD", Target::Accept)
                    .in_iface(bridge)
                    .out_iface(bridge)
                    .protocol(tp.proto)
                    .source(child)
                    .destination(parent)
                    .sport(tp.port)
                    .first(),
            ]
        })
        .collect()
}

/// DNAT and MASQUERADE rules publishing `container` on `host_ip:host_port`.
///
/// `loopback` adds the OUTPUT rule that lets host processes reach the port
/// through `127.0.0.1`.
#[must_use]
pub fn port_rules(
    proto: Protocol,
    host_ip: IpAddr,
    host_port: u16,
    container: SocketAddr,
    loopback: bool,
) -> Vec<Rule> {
    let mut prerouting = Rule::nat("PREROUTING", Target::Dnat(container)).protocol(proto);
    if !host_ip.is_unspecified() {
        prerouting = prerouting.destination(host_ip);
    }
    let mut rules = vec![prerouting.dport(host_port)];

    if loopback {
        rules.push(
            Rule::nat("OUTPUT", Target::Dnat(container))
                .protocol(proto)
                .destination(Ipv4Addr::LOCALHOST)
                .dport(host_port),
        );
    }

    rules.push(
        Rule::nat("POSTROUTING", Target::Masquerade)
            .protocol(proto)
            .source(container.ip())
            .destination(container.ip())
            .dport(container.port()),
    );
    rules
}
