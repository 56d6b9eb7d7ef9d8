//! Hardware address and interface naming helpers.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use ipnet::{Ipv4Net, Ipv6Net};
use keel_common::{KeelError, KeelResult};
use serde::{Deserialize, Serialize};

/// Prefix length above which an IPv6 subnet cannot embed a MAC address.
pub const MAX_MAC_EMBEDDING_PREFIX: u8 = 80;

/// An IEEE 802 MAC-48 hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    /// Wrap raw octets.
    #[must_use]
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// The six octets.
    #[must_use]
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Whether the locally-administered bit is set.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        self.0[0] & 0x02 != 0
    }

    /// Whether the group (multicast) bit is clear.
    #[must_use]
    pub const fn is_unicast(&self) -> bool {
        self.0[0] & 0x01 == 0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddr {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || KeelError::bad_request(format!("invalid MAC address '{s}'"));

        let mut octets = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for octet in &mut octets {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self(octets))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = KeelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddr> for String {
    fn from(mac: MacAddr) -> Self {
        mac.to_string()
    }
}

/// Generate a MAC address from an IPv4 address.
///
/// The same IP always yields the same MAC, which keeps neighbour caches
/// stable across endpoint re-creation.
///
/// The first octet is locally administered and unicast (`0x02`), and stays
/// numerically below typical bridge addresses. The second octet is a fixed
/// OUI byte; the last four carry the IPv4 address.
#[must_use]
pub fn generate_mac(ip: Ipv4Addr) -> MacAddr {
    let [a, b, c, d] = ip.octets();
    MacAddr([0x02, 0x42, a, b, c, d])
}

/// Pick the endpoint MAC: an explicit one always wins.
#[must_use]
pub fn elect_mac(explicit: Option<MacAddr>, ip: Ipv4Addr) -> MacAddr {
    explicit.unwrap_or_else(|| generate_mac(ip))
}

/// Derive an IPv6 address by writing `mac` into the low 48 bits of `network`.
///
/// Returns `None` when the prefix is too long to leave room for the MAC.
#[must_use]
pub fn ipv6_from_mac(network: Ipv6Net, mac: MacAddr) -> Option<Ipv6Addr> {
    if network.prefix_len() > MAX_MAC_EMBEDDING_PREFIX {
        return None;
    }

    let mut octets = network.network().octets();
    octets[10..].copy_from_slice(&mac.octets());
    Some(Ipv6Addr::from(octets))
}

/// Whether two IPv4 subnets overlap, i.e. one contains the other.
#[must_use]
pub fn overlaps(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

/// Generate a random interface name `prefix` + `len` hex characters.
///
/// `exists` is consulted so that a name already present on the host is
/// never returned; generation gives up after three attempts.
///
/// # Errors
///
/// Propagates lookup failures and fails if no free name was found.
pub fn generate_iface_name(
    prefix: &str,
    len: usize,
    mut exists: impl FnMut(&str) -> KeelResult<bool>,
) -> KeelResult<String> {
    for _ in 0..3 {
        let uuid = uuid::Uuid::new_v4();
        let mut suffix = hex::encode(uuid.as_bytes());
        suffix.truncate(len);
        let name = format!("{prefix}{suffix}");
        if !exists(&name)? {
            return Ok(name);
        }
    }

    Err(KeelError::internal(format!(
        "could not generate a free interface name with prefix {prefix}"
    )))
}
