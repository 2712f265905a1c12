//! Random-source egress dialer.
//!
//! The dialer owns an outer prefix, an inner subnet width, and a randomized
//! iterator over the subnet indices. Each dial pulls the next never-repeated
//! subnet, draws a uniform host address inside it, and hands the connection
//! attempt to the leak-safe egress layer. When the iterator runs dry, a
//! fresh one with new random offsets takes its place, so every subnet is
//! visited once per pass and the pass boundary is invisible from outside.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::RwLock;

use ipnetwork::IpNetwork;
use log::debug;
use thiserror::Error;

use crate::egress::{self, EgressConn, EgressError, Transport};
use crate::permute::RandomizedIterator;
use crate::subnet;

/// Configuration errors raised when constructing a dialer.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("subnet width /{subnet_bits} is outside /{prefix_bits}..=/{width} for prefix {prefix}")]
    SubnetBitsOutOfRange {
        prefix: IpNetwork,
        prefix_bits: u8,
        subnet_bits: u8,
        width: u8,
    },
    #[error("prefix {prefix} holds 2^{extra_bits} /{subnet_bits} subnets, more than the 2^63 the iterator can index")]
    PoolTooLarge {
        prefix: IpNetwork,
        subnet_bits: u8,
        extra_bits: u8,
    },
    #[error("prefix {prefix} has no /{subnet_bits} subnets to iterate")]
    EmptySubnetPool { prefix: IpNetwork, subnet_bits: u8 },
}

/// A single-use dial handle bound to one source address.
///
/// The SOCKS server holds the dialer behind a shared reference; each
/// connection gets its own `EgressDial`, so dialer state never leaks into
/// the per-connection path.
#[derive(Debug, Clone, Copy)]
pub struct EgressDial {
    source: IpAddr,
}

impl EgressDial {
    /// The source address every connection made through this handle uses.
    pub fn source(&self) -> IpAddr {
        self.source
    }

    /// Connects to `target` from the handle's source address.
    pub async fn connect(
        &self,
        transport: Transport,
        target: SocketAddr,
    ) -> Result<EgressConn, EgressError> {
        egress::connect_from(self.source, transport, target).await
    }
}

/// Dials outbound connections from pseudo-random subnets of a prefix.
#[derive(Debug)]
pub struct RandomIpDialer {
    prefix: IpNetwork,
    subnet_bits: u8,
    subnet_count: u64,
    iterator: RwLock<RandomizedIterator>,
}

impl RandomIpDialer {
    /// Creates a dialer over all /`subnet_bits` subnets of `prefix`.
    pub fn new(prefix: IpNetwork, subnet_bits: u8) -> Result<Self, ConfigError> {
        let prefix = subnet::normalize(&prefix);
        let prefix_bits = prefix.prefix();
        let width = subnet::address_width(&prefix);

        if subnet_bits < prefix_bits || subnet_bits > width {
            return Err(ConfigError::SubnetBitsOutOfRange {
                prefix,
                prefix_bits,
                subnet_bits,
                width,
            });
        }
        if subnet_bits - prefix_bits >= 64 {
            return Err(ConfigError::PoolTooLarge {
                prefix,
                subnet_bits,
                extra_bits: subnet_bits - prefix_bits,
            });
        }

        let subnet_count = subnet::subnet_count(&prefix, subnet_bits);
        if subnet_count == 0 {
            return Err(ConfigError::EmptySubnetPool {
                prefix,
                subnet_bits,
            });
        }

        debug!(
            "new dialer for {prefix} with subnet width /{subnet_bits}, pool of {subnet_count} subnets"
        );
        Ok(RandomIpDialer {
            prefix,
            subnet_bits,
            subnet_count,
            iterator: RwLock::new(RandomizedIterator::new(0, subnet_count as u128)),
        })
    }

    /// The normalized outer prefix.
    pub fn prefix(&self) -> IpNetwork {
        self.prefix
    }

    /// Number of subnets visited per pass.
    pub fn subnet_count(&self) -> u64 {
        self.subnet_count
    }

    /// Returns the next subnet of the current random pass.
    ///
    /// The fast path takes a shared lock and costs one atomic fetch-add.
    /// On exhaustion the first writer installs a fresh iterator; callers
    /// racing with it re-check under the write lock and see either the
    /// drained pass or the new one, never a torn state.
    pub fn next_subnet(&self) -> Result<IpNetwork, EgressError> {
        let next = self
            .iterator
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .next();
        let index = match next {
            Some(index) => index,
            None => self.reset_and_pull()?,
        };

        subnet::nth_subnet(&self.prefix, self.subnet_bits, index as u64).ok_or_else(|| {
            EgressError::Transport(io::Error::other(format!(
                "no subnet at index {index} in {}",
                self.prefix
            )))
        })
    }

    fn reset_and_pull(&self) -> Result<u128, EgressError> {
        let mut iter = self.iterator.write().unwrap_or_else(|e| e.into_inner());
        // Another task may have swapped the iterator in already.
        if let Some(index) = iter.next() {
            return Ok(index);
        }

        debug!(
            "used all {} subnets in the pool, starting a new pass",
            self.subnet_count
        );
        let previous = iter.offsets();
        let mut fresh = RandomizedIterator::new(0, self.subnet_count as u128);
        // A pass repeating the previous offsets would replay the exact same
        // order; draw again until they differ.
        while fresh.offsets() == previous {
            fresh = RandomizedIterator::new(0, self.subnet_count as u128);
        }
        *iter = fresh;
        iter.next().ok_or_else(|| {
            EgressError::Transport(io::Error::other(
                "fresh subnet iterator produced no index",
            ))
        })
    }

    /// Returns the next source address and a dial handle bound to it.
    pub fn next_dial(&self) -> Result<(IpAddr, EgressDial), EgressError> {
        let subnet = self.next_subnet()?;
        let source = subnet::random_host(&subnet);
        Ok((source, EgressDial { source }))
    }

    /// Dials `target` from the next random source address.
    pub async fn dial(
        &self,
        transport: Transport,
        target: SocketAddr,
    ) -> Result<EgressConn, EgressError> {
        let (_, dial) = self.next_dial()?;
        dial.connect(transport, target).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    fn net(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    #[test]
    fn covers_every_host_exactly_once_per_pass() {
        let dialer = RandomIpDialer::new(net("192.0.2.0/24"), 32).unwrap();
        assert_eq!(dialer.subnet_count(), 256);

        let mut seen = HashSet::new();
        for _ in 0..256 {
            let (source, dial) = dialer.next_dial().unwrap();
            assert_eq!(source, dial.source());
            assert!(dialer.prefix().contains(source));
            assert!(seen.insert(source), "repeated source {source}");
        }
        assert_eq!(seen.len(), 256);
    }

    #[test]
    fn two_dialers_use_different_orders() {
        let a = RandomIpDialer::new(net("192.0.2.0/24"), 32).unwrap();
        let b = RandomIpDialer::new(net("192.0.2.0/24"), 32).unwrap();

        let head_a: Vec<IpAddr> = (0..32).map(|_| a.next_dial().unwrap().0).collect();
        let head_b: Vec<IpAddr> = (0..32).map(|_| b.next_dial().unwrap().0).collect();
        assert_ne!(head_a, head_b);
    }

    #[test]
    fn v6_subnets_are_distinct_and_contained() {
        let dialer = RandomIpDialer::new(net("2001:db8::/32"), 64).unwrap();
        assert_eq!(dialer.subnet_count(), 1 << 32);

        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let subnet = dialer.next_subnet().unwrap();
            assert_eq!(subnet.prefix(), 64);
            assert!(dialer.prefix().contains(subnet.ip()));
            assert!(seen.insert(subnet), "repeated subnet {subnet}");
        }
    }

    #[test]
    fn resets_transparently_after_exhaustion() {
        let dialer = RandomIpDialer::new(net("192.0.2.0/30"), 32).unwrap();
        assert_eq!(dialer.subnet_count(), 4);

        let mut counts: HashMap<IpAddr, u32> = HashMap::new();
        for _ in 0..12 {
            let (source, _) = dialer.next_dial().unwrap();
            *counts.entry(source).or_default() += 1;
        }
        assert_eq!(counts.len(), 4);
        assert!(counts.values().all(|&c| c == 3), "uneven passes: {counts:?}");
    }

    #[test]
    fn rejects_subnet_width_outside_range() {
        assert!(matches!(
            RandomIpDialer::new(net("192.0.2.0/24"), 16),
            Err(ConfigError::SubnetBitsOutOfRange { .. })
        ));
        assert!(matches!(
            RandomIpDialer::new(net("192.0.2.0/24"), 33),
            Err(ConfigError::SubnetBitsOutOfRange { .. })
        ));
    }

    #[test]
    fn rejects_pool_beyond_the_index_space() {
        assert!(matches!(
            RandomIpDialer::new(net("2001:db8::/32"), 97),
            Err(ConfigError::PoolTooLarge { extra_bits: 65, .. })
        ));
        assert!(matches!(
            RandomIpDialer::new(net("2001:db8::/32"), 96),
            Err(ConfigError::PoolTooLarge { extra_bits: 64, .. })
        ));
    }

    #[test]
    fn rejects_prefix_with_no_subnets() {
        assert!(matches!(
            RandomIpDialer::new(net("192.0.2.0/24"), 24),
            Err(ConfigError::EmptySubnetPool { .. })
        ));
    }

    #[test]
    fn normalizes_host_bits_in_prefix() {
        let dialer = RandomIpDialer::new(net("192.0.2.99/24"), 32).unwrap();
        assert_eq!(dialer.prefix(), net("192.0.2.0/24"));
    }

    #[tokio::test]
    async fn dials_through_the_egress_layer() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                if let Ok((mut stream, _)) = listener.accept().await {
                    tokio::spawn(async move {
                        let (mut r, mut w) = stream.split();
                        let _ = tokio::io::copy(&mut r, &mut w).await;
                    });
                }
            }
        });

        // Every address in 127/8 is local to loopback, so random sources
        // bind without freebind privileges.
        let dialer = RandomIpDialer::new(net("127.0.0.0/16"), 32).unwrap();
        let conn = dialer.dial(Transport::Tcp, echo).await.unwrap();
        assert!(dialer.prefix().contains(conn.local_addr().unwrap().ip()));

        if let EgressConn::Tcp(mut stream) = conn {
            stream.write_all(b"dialer").await.unwrap();
            let mut buf = [0u8; 6];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"dialer");
        }
    }
}
