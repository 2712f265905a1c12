//! SOCKS5 target address encoding/decoding.
//!
//! Wire format: atyp(1B) | addr(var) | port(2B BE)
//!   atyp=0x01: IPv4, addr=4 bytes
//!   atyp=0x03: domain, addr=1 byte len + name
//!   atyp=0x04: IPv6, addr=16 bytes

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Target address errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddrError {
    #[error("address data too short")]
    TooShort,
    #[error("unknown address type 0x{0:02x}")]
    InvalidType(u8),
    #[error("empty domain name")]
    EmptyDomain,
    #[error("domain name longer than 255 bytes")]
    DomainTooLong,
}

/// The host half of a SOCKS5 target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetHost {
    Ip(IpAddr),
    Domain(String),
}

/// A SOCKS5 target: host plus port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetAddr {
    pub host: TargetHost,
    pub port: u16,
}

impl TargetAddr {
    pub fn new(host: TargetHost, port: u16) -> Self {
        TargetAddr { host, port }
    }

    /// Reads the address body from `r`; the atyp byte has already been
    /// consumed by the request parser.
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R, atyp: u8) -> Result<Self, AddrError> {
        match atyp {
            ATYP_IPV4 => {
                let mut buf = [0u8; 6];
                r.read_exact(&mut buf).await.map_err(|_| AddrError::TooShort)?;
                let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
                let port = u16::from_be_bytes([buf[4], buf[5]]);
                Ok(TargetAddr::new(TargetHost::Ip(IpAddr::V4(ip)), port))
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                r.read_exact(&mut len).await.map_err(|_| AddrError::TooShort)?;
                if len[0] == 0 {
                    return Err(AddrError::EmptyDomain);
                }
                let mut buf = vec![0u8; len[0] as usize + 2];
                r.read_exact(&mut buf).await.map_err(|_| AddrError::TooShort)?;
                let name = String::from_utf8_lossy(&buf[..len[0] as usize]).into_owned();
                let port = u16::from_be_bytes([buf[len[0] as usize], buf[len[0] as usize + 1]]);
                Ok(TargetAddr::new(TargetHost::Domain(name), port))
            }
            ATYP_IPV6 => {
                let mut buf = [0u8; 18];
                r.read_exact(&mut buf).await.map_err(|_| AddrError::TooShort)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[..16]);
                let port = u16::from_be_bytes([buf[16], buf[17]]);
                Ok(TargetAddr::new(
                    TargetHost::Ip(IpAddr::V6(Ipv6Addr::from(octets))),
                    port,
                ))
            }
            t => Err(AddrError::InvalidType(t)),
        }
    }

    /// Decodes an address (including the atyp byte) from a byte slice.
    /// Returns the address and the number of bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), AddrError> {
        let atyp = *data.first().ok_or(AddrError::TooShort)?;
        match atyp {
            ATYP_IPV4 => {
                if data.len() < 7 {
                    return Err(AddrError::TooShort);
                }
                let ip = Ipv4Addr::new(data[1], data[2], data[3], data[4]);
                let port = u16::from_be_bytes([data[5], data[6]]);
                Ok((TargetAddr::new(TargetHost::Ip(IpAddr::V4(ip)), port), 7))
            }
            ATYP_DOMAIN => {
                if data.len() < 2 {
                    return Err(AddrError::TooShort);
                }
                let len = data[1] as usize;
                if len == 0 {
                    return Err(AddrError::EmptyDomain);
                }
                if data.len() < 2 + len + 2 {
                    return Err(AddrError::TooShort);
                }
                let name = String::from_utf8_lossy(&data[2..2 + len]).into_owned();
                let port = u16::from_be_bytes([data[2 + len], data[3 + len]]);
                Ok((
                    TargetAddr::new(TargetHost::Domain(name), port),
                    2 + len + 2,
                ))
            }
            ATYP_IPV6 => {
                if data.len() < 19 {
                    return Err(AddrError::TooShort);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[1..17]);
                let port = u16::from_be_bytes([data[17], data[18]]);
                Ok((
                    TargetAddr::new(TargetHost::Ip(IpAddr::V6(Ipv6Addr::from(octets))), port),
                    19,
                ))
            }
            t => Err(AddrError::InvalidType(t)),
        }
    }

    /// Encodes the address, including the atyp byte.
    pub fn encode(&self) -> Result<Vec<u8>, AddrError> {
        let mut buf = Vec::with_capacity(19);
        match &self.host {
            TargetHost::Ip(IpAddr::V4(ip)) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&ip.octets());
            }
            TargetHost::Ip(IpAddr::V6(ip)) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&ip.octets());
            }
            TargetHost::Domain(name) => {
                if name.is_empty() {
                    return Err(AddrError::EmptyDomain);
                }
                if name.len() > 255 {
                    return Err(AddrError::DomainTooLong);
                }
                buf.push(ATYP_DOMAIN);
                buf.push(name.len() as u8);
                buf.extend_from_slice(name.as_bytes());
            }
        }
        buf.extend_from_slice(&self.port.to_be_bytes());
        Ok(buf)
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        TargetAddr::new(TargetHost::Ip(addr.ip()), addr.port())
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            TargetHost::Ip(IpAddr::V6(ip)) => write!(f, "[{ip}]:{}", self.port),
            TargetHost::Ip(IpAddr::V4(ip)) => write!(f, "{ip}:{}", self.port),
            TargetHost::Domain(name) => write!(f, "{name}:{}", self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_ipv4() {
        let data = [ATYP_IPV4, 192, 0, 2, 1, 0x1F, 0x90];
        let (addr, used) = TargetAddr::decode(&data).unwrap();
        assert_eq!(used, 7);
        assert_eq!(addr.port, 8080);
        assert_eq!(addr.host, TargetHost::Ip("192.0.2.1".parse().unwrap()));
    }

    #[test]
    fn decode_domain() {
        let mut data = vec![ATYP_DOMAIN, 11];
        data.extend_from_slice(b"example.com");
        data.extend_from_slice(&443u16.to_be_bytes());
        let (addr, used) = TargetAddr::decode(&data).unwrap();
        assert_eq!(used, data.len());
        assert_eq!(addr.host, TargetHost::Domain("example.com".into()));
        assert_eq!(addr.port, 443);
    }

    #[test]
    fn decode_rejects_bad_input() {
        assert_eq!(TargetAddr::decode(&[]), Err(AddrError::TooShort));
        assert_eq!(TargetAddr::decode(&[ATYP_IPV4, 1, 2]), Err(AddrError::TooShort));
        assert_eq!(TargetAddr::decode(&[0x02, 0, 0]), Err(AddrError::InvalidType(0x02)));
        assert_eq!(TargetAddr::decode(&[ATYP_DOMAIN, 0, 0, 0]), Err(AddrError::EmptyDomain));
    }

    #[test]
    fn encode_decode_roundtrip_v6() {
        let addr = TargetAddr::new(TargetHost::Ip("2001:db8::7".parse().unwrap()), 53);
        let encoded = addr.encode().unwrap();
        let (decoded, used) = TargetAddr::decode(&encoded).unwrap();
        assert_eq!(used, encoded.len());
        assert_eq!(decoded, addr);
    }

    #[tokio::test]
    async fn read_from_stream() {
        let data = [192u8, 0, 2, 9, 0, 80];
        let mut cursor = std::io::Cursor::new(&data[..]);
        let addr = TargetAddr::read_from(&mut cursor, ATYP_IPV4).await.unwrap();
        assert_eq!(addr.host, TargetHost::Ip("192.0.2.9".parse().unwrap()));
        assert_eq!(addr.port, 80);
    }
}
