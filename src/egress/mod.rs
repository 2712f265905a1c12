//! Leak-safe egress connections.
//!
//! This module owns the one step where a wrong move defeats the whole tool:
//! opening an outbound socket bound to a chosen source address. The sequence
//! is bind-with-freebind, connect, then read the kernel-reported local
//! address back and compare it to the requested one. Freebind makes the bind
//! succeed for unconfigured addresses, but some routing setups can still
//! re-source the connection; surfacing that as a fatal per-connection error
//! beats silently egressing from the host's default address.
//!
//! No retries happen here or in the dialer; errors propagate to the caller.

pub mod freebind;

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};

use log::debug;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::{TcpSocket, TcpStream, UdpSocket};

use crate::conflicts;

/// Transport used for an egress connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Udp => write!(f, "udp"),
        }
    }
}

/// Egress connection errors.
///
/// `BroadcastBind` and `LeakBind` are fatal for the connection attempt but
/// not for the process; repeated `LeakBind` errors are a signal of routing
/// misconfiguration.
#[derive(Debug, Error)]
pub enum EgressError {
    /// The requested source address is a known broadcast address.
    #[error("CRITICAL: cannot bind to broadcast address {0}")]
    BroadcastBind(IpAddr),
    /// The kernel bound the connection to a different source address.
    #[error("CRITICAL: connection bound to {actual} instead of intended {intended}, aborting to prevent a source leak")]
    LeakBind { intended: IpAddr, actual: IpAddr },
    /// The underlying bind/connect failed.
    #[error(transparent)]
    Transport(#[from] io::Error),
}

/// An established connection whose source address has been verified.
#[derive(Debug)]
pub enum EgressConn {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl EgressConn {
    /// Returns the kernel-reported local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            EgressConn::Tcp(stream) => stream.local_addr(),
            EgressConn::Udp(socket) => socket.local_addr(),
        }
    }

    /// Unwraps a TCP connection.
    pub fn into_tcp(self) -> Option<TcpStream> {
        match self {
            EgressConn::Tcp(stream) => Some(stream),
            EgressConn::Udp(_) => None,
        }
    }

    /// Unwraps a UDP socket.
    pub fn into_udp(self) -> Option<UdpSocket> {
        match self {
            EgressConn::Udp(socket) => Some(socket),
            EgressConn::Tcp(_) => None,
        }
    }
}

/// Connects to `target` with the connection's source address forced to
/// `source`, and verifies the kernel honored it.
///
/// Dropping the returned future cancels the connect and closes the socket;
/// a cancelled dial can never surface as a leak.
pub async fn connect_from(
    source: IpAddr,
    transport: Transport,
    target: SocketAddr,
) -> Result<EgressConn, EgressError> {
    debug!("dial {transport} from {source} to {target}");

    if conflicts::is_broadcast(&source) {
        return Err(EgressError::BroadcastBind(source));
    }
    if source.is_ipv4() != target.ip().is_ipv4() {
        return Err(EgressError::Transport(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("source {source} and target {target} are different address families"),
        )));
    }

    let local = SocketAddr::new(source, 0);
    let conn = match transport {
        Transport::Tcp => {
            let stream = tcp_connect(local, target).await?;
            EgressConn::Tcp(stream)
        }
        Transport::Udp => {
            let socket = udp_connect(local, target)?;
            EgressConn::Udp(socket)
        }
    };

    let actual = conn.local_addr()?.ip();
    if actual != source {
        // Dropping `conn` closes the socket before the error escapes.
        return Err(EgressError::LeakBind {
            intended: source,
            actual,
        });
    }
    debug!("verified connection bound to intended source {actual}");
    Ok(conn)
}

async fn tcp_connect(local: SocketAddr, target: SocketAddr) -> Result<TcpStream, EgressError> {
    let socket = Socket::new(domain_of(&local), Type::STREAM, Some(Protocol::TCP))?;
    freebind::apply(&socket, local.is_ipv6())?;
    socket.bind(&local.into())?;
    socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(socket.into());
    Ok(socket.connect(target).await?)
}

fn udp_connect(local: SocketAddr, target: SocketAddr) -> Result<UdpSocket, EgressError> {
    let socket = Socket::new(domain_of(&local), Type::DGRAM, Some(Protocol::UDP))?;
    freebind::apply(&socket, local.is_ipv6())?;
    socket.bind(&local.into())?;
    socket.connect(&target.into())?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

fn domain_of(addr: &SocketAddr) -> Domain {
    if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    }
}
