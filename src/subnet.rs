//! Prefix arithmetic over the subnets of a CIDR block.
//!
//! A /p prefix contains 2^(k-p) subnets of width /k. This module computes
//! that count, addresses the n-th subnet in canonical (address) order, and
//! draws a uniform host address out of a subnet. Canonical ordering matters:
//! the permutation layer maps indices to indices, and only a deterministic
//! index-to-subnet layout turns that into a bijection over address space.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use rand::RngCore;

/// Returns the addressing width for the network's family: 32 or 128.
pub fn address_width(network: &IpNetwork) -> u8 {
    match network {
        IpNetwork::V4(_) => 32,
        IpNetwork::V6(_) => 128,
    }
}

/// Returns the network with its host bits cleared.
pub fn normalize(network: &IpNetwork) -> IpNetwork {
    match network {
        IpNetwork::V4(net) => Ipv4Network::new(net.network(), net.prefix())
            .map(IpNetwork::V4)
            .unwrap_or(*network),
        IpNetwork::V6(net) => Ipv6Network::new(net.network(), net.prefix())
            .map(IpNetwork::V6)
            .unwrap_or(*network),
    }
}

/// Returns the number of /`new_prefix` subnets inside `network`.
///
/// Returns 0 when `new_prefix` does not cut the network into subnets:
/// `new_prefix <= prefix`, `new_prefix` beyond the address width, or a pool
/// of 2^64 or more, which does not fit the iterator's index space. Callers
/// treat 0 as "no subnets".
pub fn subnet_count(network: &IpNetwork, new_prefix: u8) -> u64 {
    let prefix = network.prefix();
    if new_prefix <= prefix || new_prefix > address_width(network) {
        return 0;
    }
    let extra = new_prefix - prefix;
    if extra >= 64 {
        return 0;
    }
    1u64 << extra
}

/// Returns the n-th /`new_prefix` subnet of `network` in address order,
/// or `None` when `n` is out of range.
pub fn nth_subnet(network: &IpNetwork, new_prefix: u8, n: u64) -> Option<IpNetwork> {
    let count = subnet_count(network, new_prefix);
    if count == 0 || n >= count {
        return None;
    }

    match network {
        IpNetwork::V4(net) => {
            let base = u32::from(net.network()) as u64;
            let start = base + (n << (32 - new_prefix));
            Ipv4Network::new(Ipv4Addr::from(start as u32), new_prefix)
                .map(IpNetwork::V4)
                .ok()
        }
        IpNetwork::V6(net) => {
            let base = u128::from_be_bytes(net.network().octets());
            let start = base + ((n as u128) << (128 - new_prefix));
            Ipv6Network::new(Ipv6Addr::from(start), new_prefix)
                .map(IpNetwork::V6)
                .ok()
        }
    }
}

/// Draws a uniform host address from `subnet`: the network bits are kept
/// and the host bits are filled from a non-cryptographic PRNG.
///
/// No address is excluded here; colliding with a local broadcast address is
/// detected at bind time by the conflict registry.
pub fn random_host(subnet: &IpNetwork) -> IpAddr {
    let mut rng = rand::thread_rng();
    match subnet {
        IpNetwork::V4(net) => {
            let ip = net.ip().octets();
            let mask = net.mask().octets();
            let mut fill = [0u8; 4];
            rng.fill_bytes(&mut fill);
            let mut host = [0u8; 4];
            for i in 0..4 {
                host[i] = (ip[i] & mask[i]) | (fill[i] & !mask[i]);
            }
            IpAddr::V4(Ipv4Addr::from(host))
        }
        IpNetwork::V6(net) => {
            let ip = net.ip().octets();
            let mask = net.mask().octets();
            let mut fill = [0u8; 16];
            rng.fill_bytes(&mut fill);
            let mut host = [0u8; 16];
            for i in 0..16 {
                host[i] = (ip[i] & mask[i]) | (fill[i] & !mask[i]);
            }
            IpAddr::V6(Ipv6Addr::from(host))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    #[test]
    fn count_basic() {
        assert_eq!(subnet_count(&net("192.0.2.0/24"), 32), 256);
        assert_eq!(subnet_count(&net("192.0.2.0/24"), 26), 4);
        assert_eq!(subnet_count(&net("2001:db8::/32"), 64), 1 << 32);
        assert_eq!(subnet_count(&net("2001:db8::/48"), 64), 1 << 16);
    }

    #[test]
    fn count_degenerate() {
        // Equal or wider target prefix cuts nothing.
        assert_eq!(subnet_count(&net("192.0.2.0/24"), 24), 0);
        assert_eq!(subnet_count(&net("192.0.2.0/24"), 16), 0);
        // Past the address width.
        assert_eq!(subnet_count(&net("192.0.2.0/24"), 33), 0);
        // 2^64 subnets do not fit the index space.
        assert_eq!(subnet_count(&net("2001:db8::/32"), 96), 0);
        assert_eq!(subnet_count(&net("2001:db8::/32"), 128), 0);
    }

    #[test]
    fn nth_subnet_v4() {
        let outer = net("192.0.2.0/24");
        assert_eq!(nth_subnet(&outer, 26, 0), Some(net("192.0.2.0/26")));
        assert_eq!(nth_subnet(&outer, 26, 1), Some(net("192.0.2.64/26")));
        assert_eq!(nth_subnet(&outer, 26, 3), Some(net("192.0.2.192/26")));
        assert_eq!(nth_subnet(&outer, 26, 4), None);
        // Single-host subnets.
        assert_eq!(nth_subnet(&outer, 32, 255), Some(net("192.0.2.255/32")));
    }

    #[test]
    fn nth_subnet_v6() {
        let outer = net("2001:db8::/32");
        assert_eq!(nth_subnet(&outer, 48, 0), Some(net("2001:db8::/48")));
        assert_eq!(nth_subnet(&outer, 48, 1), Some(net("2001:db8:1::/48")));
        assert_eq!(nth_subnet(&outer, 48, 0xffff), Some(net("2001:db8:ffff::/48")));
        assert_eq!(nth_subnet(&outer, 48, 0x10000), None);
    }

    #[test]
    fn nth_subnet_out_of_range() {
        assert_eq!(nth_subnet(&net("192.0.2.0/24"), 24, 0), None);
        assert_eq!(nth_subnet(&net("192.0.2.0/24"), 16, 0), None);
    }

    #[test]
    fn nth_subnets_are_contained_and_sized() {
        let outer = net("2001:db8::/32");
        for n in [0u64, 1, 77, 65535] {
            let sub = nth_subnet(&outer, 64, n).unwrap();
            assert_eq!(sub.prefix(), 64);
            assert!(outer.contains(sub.ip()));
        }
    }

    #[test]
    fn random_host_stays_inside_subnet() {
        let subnet = net("192.0.2.64/26");
        for _ in 0..100 {
            let host = random_host(&subnet);
            assert!(subnet.contains(host));
        }

        let subnet = net("2001:db8:42::/64");
        for _ in 0..100 {
            let host = random_host(&subnet);
            assert!(subnet.contains(host));
        }
    }

    #[test]
    fn random_host_of_single_host_subnet() {
        let subnet = net("192.0.2.7/32");
        assert_eq!(random_host(&subnet), "192.0.2.7".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn normalize_clears_host_bits() {
        assert_eq!(normalize(&net("192.0.2.77/24")), net("192.0.2.0/24"));
        assert_eq!(normalize(&net("2001:db8::beef/32")), net("2001:db8::/32"));
    }
}
