//! Link and address management through `ip(8)`.

use std::net::Ipv4Addr;
use std::process::Command;

use ipnet::{IpNet, Ipv4Net};
use keel_common::{KeelError, KeelResult};

use crate::netutils::MacAddr;
use crate::provision::LinkAddresses;

/// Run `ip` with `args`, returning its standard output.
///
/// Failures naming a missing device become [`KeelError::LinkNotFound`] and
/// failures about an existing object become [`KeelError::LinkExists`];
/// `subject` is the link named in those errors.
fn ip(subject: &str, args: &[&str]) -> KeelResult<String> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .map_err(|e| KeelError::CommandFailed {
            command: format!("ip {}", args.join(" ")),
            message: e.to_string(),
        })?;

    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Err(classify(subject, &format!("ip {}", args.join(" ")), stderr))
}

fn classify(subject: &str, command: &str, stderr: String) -> KeelError {
    if stderr.contains("Cannot find device") || stderr.contains("does not exist") {
        KeelError::LinkNotFound {
            name: subject.to_string(),
        }
    } else if stderr.contains("File exists") {
        KeelError::LinkExists {
            name: subject.to_string(),
        }
    } else {
        KeelError::CommandFailed {
            command: command.to_string(),
            message: stderr,
        }
    }
}

/// Whether a link named `name` exists.
///
/// # Errors
///
/// Fails if `ip` cannot be run or fails for another reason.
pub fn exists(name: &str) -> KeelResult<bool> {
    match ip(name, &["link", "show", name]) {
        Ok(_) => Ok(true),
        Err(e) if e.is_link_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Create a bridge device.
///
/// # Errors
///
/// [`KeelError::LinkExists`] if the name is taken.
pub fn add_bridge(name: &str) -> KeelResult<()> {
    tracing::debug!(name, "Creating bridge");
    ip(name, &["link", "add", "name", name, "type", "bridge"]).map(drop)
}

/// Create a veth pair.
///
/// # Errors
///
/// [`KeelError::LinkExists`] if either name is taken.
pub fn add_veth(host: &str, peer: &str) -> KeelResult<()> {
    tracing::debug!(host, peer, "Creating veth pair");
    ip(host, &["link", "add", host, "type", "veth", "peer", "name", peer]).map(drop)
}

/// Delete a link. Deleting one end of a veth pair deletes both.
///
/// # Errors
///
/// [`KeelError::LinkNotFound`] if there is no such link.
pub fn delete(name: &str) -> KeelResult<()> {
    tracing::debug!(name, "Deleting link");
    ip(name, &["link", "delete", name]).map(drop)
}

/// Set a link attribute: `ip link set <name> <args..>`.
///
/// # Errors
///
/// [`KeelError::LinkNotFound`] if there is no such link.
pub fn set(name: &str, args: &[&str]) -> KeelResult<()> {
    let mut full = vec!["link", "set", "dev", name];
    full.extend_from_slice(args);
    ip(name, &full).map(drop)
}

/// Set the hardware address.
///
/// # Errors
///
/// See [`set`].
pub fn set_address(name: &str, mac: MacAddr) -> KeelResult<()> {
    set(name, &["address", &mac.to_string()])
}

/// Addresses configured on `name`.
///
/// # Errors
///
/// [`KeelError::LinkNotFound`] if there is no such link.
pub fn addresses(name: &str) -> KeelResult<LinkAddresses> {
    ip(name, &["-o", "addr", "show", "dev", name]).map(|out| parse_addresses(&out))
}

/// Add an address.
///
/// # Errors
///
/// [`KeelError::LinkExists`] if the address is already configured.
pub fn add_address(name: &str, address: IpNet) -> KeelResult<()> {
    ip(name, &["addr", "add", &address.to_string(), "dev", name]).map(drop)
}

/// Remove an address.
///
/// # Errors
///
/// Fails if the address is not configured.
pub fn del_address(name: &str, address: IpNet) -> KeelResult<()> {
    ip(name, &["addr", "del", &address.to_string(), "dev", name]).map(drop)
}

/// Destinations of the IPv4 routes in the main table, default route
/// excluded.
///
/// # Errors
///
/// Fails if `ip` cannot be run.
pub fn routes_v4() -> KeelResult<Vec<Ipv4Net>> {
    ip("", &["-o", "-4", "route", "show"]).map(|out| parse_routes(&out))
}

/// Parse `ip -o addr show` output.
fn parse_addresses(output: &str) -> LinkAddresses {
    let mut addresses = LinkAddresses::default();
    for line in output.lines() {
        let mut fields = line.split_whitespace();
        while let Some(field) = fields.next() {
            match field {
                "inet" => {
                    if let Some(net) = fields.next().and_then(|a| a.parse().ok()) {
                        addresses.v4.push(net);
                    }
                }
                "inet6" => {
                    if let Some(net) = fields.next().and_then(|a| a.parse().ok()) {
                        addresses.v6.push(net);
                    }
                }
                _ => {}
            }
        }
    }
    addresses
}

/// Parse `ip -o -4 route show` output.
fn parse_routes(output: &str) -> Vec<Ipv4Net> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|dest| *dest != "default")
        .filter_map(|dest| {
            dest.parse::<Ipv4Net>()
                .ok()
                .or_else(|| dest.parse::<Ipv4Addr>().ok().map(Ipv4Net::from))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_from_ip_output() {
        let out = "\
5: br0    inet 172.18.0.1/16 brd 172.18.255.255 scope global br0\\       valid_lft forever preferred_lft forever
5: br0    inet6 fe80::1/64 scope link \\       valid_lft forever preferred_lft forever
";
        let addrs = parse_addresses(out);
        assert_eq!(addrs.v4, vec!["172.18.0.1/16".parse::<Ipv4Net>().unwrap()]);
        assert_eq!(addrs.v6.len(), 1);
        assert_eq!(addrs.v6[0].to_string(), "fe80::1/64");
    }

    #[test]
    fn routes_skip_default() {
        let out = "\
default via 192.168.1.1 dev eth0 proto dhcp metric 100
172.17.0.0/16 dev docker0 proto kernel scope link src 172.17.0.1
192.168.1.0/24 dev eth0 proto kernel scope link src 192.168.1.20
10.8.0.1 dev tun0 scope link
";
        let routes: Vec<String> = parse_routes(out).iter().map(ToString::to_string).collect();
        assert_eq!(routes, ["172.17.0.0/16", "192.168.1.0/24", "10.8.0.1/32"]);
    }

    #[test]
    fn stderr_classification() {
        let err = classify("br9", "ip link show br9", "Device \"br9\" does not exist.".into());
        assert!(err.is_link_not_found());

        let err = classify("br0", "ip link add", "RTNETLINK answers: File exists".into());
        assert!(matches!(err, KeelError::LinkExists { .. }));

        let err = classify("br0", "ip link add", "Operation not permitted".into());
        assert!(matches!(err, KeelError::CommandFailed { .. }));
    }

    #[test]
    fn missing_link_does_not_exist() {
        // Hosts without iproute2 cannot answer at all.
        if let Ok(found) = exists("keeltest_nonexistent0") {
            assert!(!found);
        }
    }
}
