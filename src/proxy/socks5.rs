//! SOCKS5 proxy server with randomized egress.
//!
//! Supports:
//! - SOCKS5 auth negotiation (NO AUTH)
//! - SOCKS5 CONNECT, dialed from a random source address per connection
//! - SOCKS5 UDP ASSOCIATE, with one random-source egress socket per target
//!
//! The server holds the dialer behind a shared reference; every accepted
//! connection gets its own task and its own dial handle, so a leak or
//! broadcast error poisons one connection attempt and nothing else.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, error};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Notify;

use crate::dialer::RandomIpDialer;
use crate::egress::{EgressError, Transport};
use crate::resolver;

use super::addr::{AddrError, TargetAddr, TargetHost, ATYP_IPV4, ATYP_IPV6};

// SOCKS5 protocol constants.
pub const VERSION5: u8 = 0x05;
pub const AUTH_NONE: u8 = 0x00;
pub const AUTH_NO_ACCEPT: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const REP_SUCCESS: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_NOT_ALLOWED: u8 = 0x02;
pub const REP_NETWORK_UNREACH: u8 = 0x03;
pub const REP_HOST_UNREACH: u8 = 0x04;
pub const REP_CONN_REFUSED: u8 = 0x05;
pub const REP_TTL_EXPIRED: u8 = 0x06;
pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDR_NOT_SUPPORTED: u8 = 0x08;

/// Proxy errors.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy IO error: {0}")]
    Io(#[from] io::Error),
    #[error("proxy address error: {0}")]
    Addr(#[from] AddrError),
    #[error("invalid protocol")]
    InvalidProtocol,
    #[error("no acceptable auth method")]
    InvalidAuth,
    #[error("unsupported command: 0x{0:02x}")]
    UnsupportedCommand(u8),
}

/// SOCKS5 proxy server that egresses from random source addresses.
pub struct Server {
    listener: TcpListener,
    dialer: Arc<RandomIpDialer>,
    shutdown: Arc<Notify>,
}

impl Server {
    /// Creates a server bound to `addr`, egressing through `dialer`.
    pub async fn bind(addr: &str, dialer: Arc<RandomIpDialer>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Server {
            listener,
            dialer,
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the server, accepting connections until shutdown.
    pub async fn serve(&self) {
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let dialer = self.dialer.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_conn(stream, peer, &dialer).await {
                                    debug!("connection from {peer}: {e}");
                                }
                            });
                        }
                        Err(_) => continue,
                    }
                }
                _ = self.shutdown.notified() => return,
            }
        }
    }

    /// Signals the server to stop accepting.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

/// Handles a single client connection.
async fn handle_conn(
    mut stream: TcpStream,
    peer: SocketAddr,
    dialer: &RandomIpDialer,
) -> Result<(), ProxyError> {
    let mut version = [0u8; 1];
    stream.read_exact(&mut version).await?;
    if version[0] != VERSION5 {
        return Err(ProxyError::InvalidProtocol);
    }

    // === Auth negotiation ===
    let mut n_methods = [0u8; 1];
    stream.read_exact(&mut n_methods).await?;

    let mut methods = vec![0u8; n_methods[0] as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&AUTH_NONE) {
        stream.write_all(&[VERSION5, AUTH_NO_ACCEPT]).await?;
        return Err(ProxyError::InvalidAuth);
    }
    stream.write_all(&[VERSION5, AUTH_NONE]).await?;

    // === Request ===
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION5 {
        return Err(ProxyError::InvalidProtocol);
    }

    let cmd = header[1];
    let atyp = header[3];
    let addr = TargetAddr::read_from(&mut stream, atyp).await?;

    match cmd {
        CMD_CONNECT => handle_connect(&mut stream, peer, dialer, addr).await,
        CMD_UDP_ASSOCIATE => handle_udp_associate(&mut stream, peer, dialer).await,
        _ => {
            send_reply(&mut stream, REP_CMD_NOT_SUPPORTED, None).await?;
            Err(ProxyError::UnsupportedCommand(cmd))
        }
    }
}

/// Handles the CONNECT command.
async fn handle_connect(
    stream: &mut TcpStream,
    peer: SocketAddr,
    dialer: &RandomIpDialer,
    addr: TargetAddr,
) -> Result<(), ProxyError> {
    let target = match resolve_target(&addr, dialer.prefix().is_ipv6()).await {
        Ok(target) => target,
        Err(e) => {
            debug!("resolve {addr}: {e}");
            send_reply(stream, REP_HOST_UNREACH, None).await?;
            return Ok(());
        }
    };

    let remote = match dialer.dial(Transport::Tcp, target).await {
        Ok(conn) => match conn.into_tcp() {
            Some(remote) => remote,
            None => {
                send_reply(stream, REP_GENERAL_FAILURE, None).await?;
                return Ok(());
            }
        },
        Err(e) => {
            log_dial_error(&e, &addr);
            send_reply(stream, reply_code(&e), None).await?;
            return Ok(());
        }
    };

    let bound = remote.local_addr()?;
    debug!("connect {peer} -> {addr} via {}", bound.ip());
    send_reply(stream, REP_SUCCESS, Some(bound)).await?;

    relay(stream, remote).await;
    Ok(())
}

/// Handles the UDP ASSOCIATE command.
///
/// A relay socket faces the client; each distinct target gets its own
/// egress socket dialed from a fresh random source. The association lives
/// until the control connection closes.
async fn handle_udp_associate(
    stream: &mut TcpStream,
    peer: SocketAddr,
    dialer: &RandomIpDialer,
) -> Result<(), ProxyError> {
    let relay = Arc::new(UdpSocket::bind(SocketAddr::new(stream.local_addr()?.ip(), 0)).await?);
    let relay_addr = relay.local_addr()?;
    debug!("udp associate for {peer} relaying on {relay_addr}");
    send_reply(stream, REP_SUCCESS, Some(relay_addr)).await?;

    let want_v6 = dialer.prefix().is_ipv6();
    let mut client: Option<SocketAddr> = None;
    let mut egress: HashMap<SocketAddr, Arc<UdpSocket>> = HashMap::new();
    let mut forwarders = Vec::new();
    let mut control = [0u8; 1];
    let mut buf = vec![0u8; 65535];

    let result = loop {
        tokio::select! {
            // The association dies with the control connection.
            read = stream.read(&mut control) => {
                match read {
                    Ok(0) => break Ok(()),
                    Ok(_) => continue,
                    Err(e) => break Err(ProxyError::Io(e)),
                }
            }
            recv = relay.recv_from(&mut buf) => {
                let (n, from) = match recv {
                    Ok(r) => r,
                    Err(e) => break Err(ProxyError::Io(e)),
                };
                match client {
                    None => client = Some(from),
                    Some(c) if c != from => continue,
                    _ => {}
                }

                let Ok((addr, payload)) = parse_udp_datagram(&buf[..n]) else {
                    continue;
                };
                let Ok(target) = resolve_target(&addr, want_v6).await else {
                    continue;
                };

                let socket = match egress.get(&target) {
                    Some(socket) => socket.clone(),
                    None => match open_udp_egress(dialer, &addr, target).await {
                        Some(socket) => {
                            // One forwarder per egress socket carries
                            // responses back to the client.
                            if let Some(client) = client {
                                forwarders.push(tokio::spawn(forward_udp_responses(
                                    socket.clone(),
                                    relay.clone(),
                                    target,
                                    client,
                                )));
                            }
                            egress.insert(target, socket.clone());
                            socket
                        }
                        None => continue,
                    },
                };
                let _ = socket.send(payload).await;
            }
        }
    };

    for forwarder in forwarders {
        forwarder.abort();
    }
    result
}

async fn open_udp_egress(
    dialer: &RandomIpDialer,
    addr: &TargetAddr,
    target: SocketAddr,
) -> Option<Arc<UdpSocket>> {
    match dialer.dial(Transport::Udp, target).await {
        Ok(conn) => conn.into_udp().map(Arc::new),
        Err(e) => {
            log_dial_error(&e, addr);
            None
        }
    }
}

/// Reads responses from one egress socket and relays them to the client
/// wrapped in the SOCKS5 UDP header.
async fn forward_udp_responses(
    egress: Arc<UdpSocket>,
    relay: Arc<UdpSocket>,
    target: SocketAddr,
    client: SocketAddr,
) {
    let mut buf = vec![0u8; 65535];
    loop {
        let Ok(n) = egress.recv(&mut buf).await else {
            return;
        };
        let Ok(datagram) = build_udp_datagram(&TargetAddr::from(target), &buf[..n]) else {
            continue;
        };
        if relay.send_to(&datagram, client).await.is_err() {
            return;
        }
    }
}

/// Resolves a target to a socket address in the egress address family.
async fn resolve_target(addr: &TargetAddr, want_v6: bool) -> io::Result<SocketAddr> {
    match &addr.host {
        TargetHost::Ip(ip) => Ok(SocketAddr::new(*ip, addr.port)),
        TargetHost::Domain(name) => resolver::resolve(name, addr.port, want_v6).await,
    }
}

/// Maps an egress failure to a SOCKS5 reply code.
fn reply_code(e: &EgressError) -> u8 {
    match e {
        EgressError::BroadcastBind(_) | EgressError::LeakBind { .. } => REP_GENERAL_FAILURE,
        EgressError::Transport(io) => match io.kind() {
            io::ErrorKind::ConnectionRefused => REP_CONN_REFUSED,
            io::ErrorKind::TimedOut => REP_HOST_UNREACH,
            _ => REP_GENERAL_FAILURE,
        },
    }
}

fn log_dial_error(e: &EgressError, addr: &TargetAddr) {
    match e {
        // Bind-safety violations are the one thing this tool exists to
        // prevent; they stay visible at the default log level.
        EgressError::BroadcastBind(_) | EgressError::LeakBind { .. } => error!("{e}"),
        EgressError::Transport(_) => debug!("dial {addr}: {e}"),
    }
}

/// Sends a SOCKS5 reply.
///
/// The bound address is always one of our own sockets (the verified egress
/// source for CONNECT, the relay socket for UDP ASSOCIATE), never a domain,
/// so the reply is built straight from the socket address. Replies with no
/// address use the all-zero IPv4 form.
pub async fn send_reply<W: AsyncWrite + Unpin>(
    w: &mut W,
    rep: u8,
    bound: Option<SocketAddr>,
) -> io::Result<()> {
    let mut reply = Vec::with_capacity(22);
    reply.extend_from_slice(&[VERSION5, rep, 0x00]);
    match bound {
        Some(SocketAddr::V4(v4)) => {
            reply.push(ATYP_IPV4);
            reply.extend_from_slice(&v4.ip().octets());
            reply.extend_from_slice(&v4.port().to_be_bytes());
        }
        Some(SocketAddr::V6(v6)) => {
            reply.push(ATYP_IPV6);
            reply.extend_from_slice(&v6.ip().octets());
            reply.extend_from_slice(&v6.port().to_be_bytes());
        }
        None => reply.extend_from_slice(&[ATYP_IPV4, 0, 0, 0, 0, 0, 0]),
    }
    w.write_all(&reply).await
}

/// Shuttles bytes between the client and the egress connection until both
/// directions have closed. A half-close from either side is propagated as a
/// shutdown of the opposite write half, so downloads finish even after the
/// client stops sending.
pub async fn relay<A, B>(client: &mut A, mut remote: B)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let _ = tokio::io::copy_bidirectional(client, &mut remote).await;
}

/// SOCKS5 UDP request header: RSV(2) + FRAG(1), ahead of the target address.
const UDP_HEADER_LEN: usize = 3;

/// Parses a SOCKS5 UDP datagram into its target address and payload.
pub fn parse_udp_datagram(data: &[u8]) -> Result<(TargetAddr, &[u8]), ProxyError> {
    if data.len() <= UDP_HEADER_LEN {
        return Err(ProxyError::InvalidProtocol);
    }
    if data[..2] != [0, 0] {
        return Err(ProxyError::InvalidProtocol);
    }
    if data[2] != 0 {
        // Fragmented datagrams are not supported.
        return Err(ProxyError::InvalidProtocol);
    }
    let (addr, consumed) = TargetAddr::decode(&data[UDP_HEADER_LEN..])?;
    Ok((addr, &data[UDP_HEADER_LEN + consumed..]))
}

/// Builds a SOCKS5 UDP datagram around a payload.
pub fn build_udp_datagram(addr: &TargetAddr, payload: &[u8]) -> Result<Vec<u8>, AddrError> {
    let encoded = addr.encode()?;
    let mut datagram = Vec::with_capacity(UDP_HEADER_LEN + encoded.len() + payload.len());
    datagram.extend_from_slice(&[0, 0, 0]); // RSV + FRAG
    datagram.extend_from_slice(&encoded);
    datagram.extend_from_slice(payload);
    Ok(datagram)
}
