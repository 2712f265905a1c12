//! Family-aware name resolution for proxy targets.
//!
//! A domain target must resolve to the same address family as the egress
//! prefix: dialing an IPv4 destination from an IPv6 source (or vice versa)
//! can only fail, so the wrong-family records are filtered out up front.

use std::io;
use std::net::SocketAddr;

use log::debug;
use tokio::net::lookup_host;

/// Resolves `host:port` to a socket address in the requested family.
///
/// IP literals pass straight through `lookup_host` without a DNS query.
pub async fn resolve(host: &str, port: u16, want_v6: bool) -> io::Result<SocketAddr> {
    let addrs = lookup_host((host, port)).await?;
    for addr in addrs {
        if addr.is_ipv6() == want_v6 {
            debug!("resolved {host:?} to {}", addr.ip());
            return Ok(addr);
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AddrNotAvailable,
        format!(
            "no {} address found for {host:?}",
            if want_v6 { "IPv6" } else { "IPv4" }
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_v4_literal() {
        let addr = resolve("127.0.0.1", 80, false).await.unwrap();
        assert_eq!(addr, "127.0.0.1:80".parse().unwrap());
    }

    #[tokio::test]
    async fn resolves_v6_literal() {
        let addr = resolve("::1", 443, true).await.unwrap();
        assert_eq!(addr, "[::1]:443".parse().unwrap());
    }

    #[tokio::test]
    async fn rejects_wrong_family_literal() {
        let err = resolve("127.0.0.1", 80, true).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrNotAvailable);
    }
}
