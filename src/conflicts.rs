//! Broadcast-address pre-scan.
//!
//! Binding an egress socket to the broadcast address of a locally configured
//! interface produces malformed outbound traffic. The scan runs once at
//! startup: every IPv4 interface address contributes its broadcast address
//! `ip | !mask`, and the ones that fall inside the configured prefix land in
//! a process-global registry consulted on every bind. IPv6 has no broadcast,
//! so v6-only configurations scan nothing.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::RwLock;

use ipnetwork::IpNetwork;
use log::warn;
use once_cell::sync::Lazy;
use pnet::datalink;

static BROADCAST_ADDRS: Lazy<RwLock<HashSet<Ipv4Addr>>> =
    Lazy::new(|| RwLock::new(HashSet::new()));

/// Scans all local interfaces and registers every IPv4 broadcast address
/// that falls inside `prefix`. Returns the conflicting addresses so the
/// caller can surface a warning per hit.
pub fn check_host_conflicts(prefix: &IpNetwork) -> Vec<Ipv4Addr> {
    let mut conflicts = Vec::new();
    for iface in datalink::interfaces() {
        for addr in &iface.ips {
            let (ip, mask) = match addr {
                pnet::ipnetwork::IpNetwork::V4(net) => (net.ip(), net.mask()),
                pnet::ipnetwork::IpNetwork::V6(_) => continue,
            };
            let broadcast = broadcast_of(ip, mask);
            if prefix.contains(IpAddr::V4(broadcast)) {
                warn!(
                    "interface {} broadcast address {} is inside prefix {}",
                    iface.name, broadcast, prefix
                );
                conflicts.push(broadcast);
            }
        }
    }
    register(conflicts.iter().copied());
    conflicts
}

/// Adds addresses to the registry.
pub(crate) fn register<I: IntoIterator<Item = Ipv4Addr>>(ips: I) {
    BROADCAST_ADDRS.write().unwrap_or_else(|e| e.into_inner()).extend(ips);
}

/// Returns true when `ip` was flagged as a broadcast address by the scan.
pub fn is_broadcast(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => BROADCAST_ADDRS
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(v4),
        IpAddr::V6(_) => false,
    }
}

/// Byte-wise `ip | !mask`.
fn broadcast_of(ip: Ipv4Addr, mask: Ipv4Addr) -> Ipv4Addr {
    let ip = ip.octets();
    let mask = mask.octets();
    let mut out = [0u8; 4];
    for i in 0..4 {
        out[i] = ip[i] | !mask[i];
    }
    Ipv4Addr::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_arithmetic() {
        let cases = [
            ("10.0.0.5", "255.255.255.0", "10.0.0.255"),
            ("172.16.4.1", "255.255.0.0", "172.16.255.255"),
            ("192.0.2.9", "255.255.255.255", "192.0.2.9"),
        ];
        for (ip, mask, want) in cases {
            assert_eq!(
                broadcast_of(ip.parse().unwrap(), mask.parse().unwrap()),
                want.parse::<Ipv4Addr>().unwrap()
            );
        }
    }

    #[test]
    fn registry_lookup() {
        register(["10.99.0.255".parse::<Ipv4Addr>().unwrap()]);
        assert!(is_broadcast(&"10.99.0.255".parse::<IpAddr>().unwrap()));
        assert!(!is_broadcast(&"10.99.0.1".parse::<IpAddr>().unwrap()));
        // IPv6 never hits the registry.
        assert!(!is_broadcast(&"2001:db8::1".parse::<IpAddr>().unwrap()));
    }

    #[test]
    fn scan_against_documentation_prefix_is_clean() {
        // TEST-NET-1 is never assigned to a real interface, so the scan
        // must come back empty no matter what the host looks like.
        let prefix: IpNetwork = "192.0.2.0/24".parse().unwrap();
        assert!(check_host_conflicts(&prefix).is_empty());
    }
}
