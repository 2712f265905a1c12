//! stargate: a SOCKS5 proxy that egresses every connection from a random
//! source address inside a routed CIDR.
//!
//! The prefix is split into /k subnets, visited in a pseudo-random
//! non-repeating order; each connection binds to a random host inside the
//! next subnet and the kernel-reported source is verified before any bytes
//! flow.
//!
//! Usage:
//!   stargate [OPTIONS] <CIDR>
//!   stargate --subnet-size 64 2001:db8::/48

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ipnetwork::IpNetwork;
use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use stargate::conflicts;
use stargate::dialer::{EgressDial, RandomIpDialer};
use stargate::egress::{freebind, Transport};
use stargate::proxy::Server;
use stargate::resolver;
use stargate::subnet;

/// Maximum time for one test-mode request.
const TEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Concurrent test-mode workers.
const TEST_PARALLEL: u64 = 10;
/// Plain-HTTP echo service that answers with the caller's address.
const TEST_HOST: &str = "icanhazip.com";
const TEST_PORT: u16 = 80;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// CIDR to egress from, e.g. "192.0.2.0/24" or "2001:db8::/48"
    cidr: String,

    /// ip:port or bare port for the SOCKS5 listener
    #[arg(short, long, default_value = "127.0.0.1:1080")]
    listen: String,

    /// Egress subnet width; defaults to per-host selection (/32 or /128)
    #[arg(short = 's', long = "subnet-size")]
    subnet_size: Option<u8>,

    /// Verify egress from every enumerated source IP, then exit
    #[arg(long)]
    test: bool,

    /// Enable per-connection logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let (prefix, subnet_bits) = validate(&args.cidr, args.subnet_size)?;

    if !freebind::supported() {
        warn!("this platform cannot bind to unconfigured addresses; egress only works from locally assigned prefixes");
    }

    for ip in conflicts::check_host_conflicts(&prefix) {
        warn!("possible IP conflict on {ip}");
    }

    let dialer = Arc::new(RandomIpDialer::new(prefix, subnet_bits)?);
    let hosts_per_subnet = 1u128 << (subnet::address_width(&prefix) - subnet_bits);
    info!(
        "running on {prefix} with subnet width /{subnet_bits}: {} egress subnets with {} addresses each",
        dialer.subnet_count(),
        hosts_per_subnet
    );

    if args.test {
        run_test(dialer).await?;
        info!("all tests passed");
        return Ok(());
    }

    let listen = normalize_listen(&args.listen);
    info!("starting subnet egress proxy on {listen}");
    let server = Server::bind(&listen, dialer).await?;
    server.serve().await;
    Ok(())
}

/// Parses and validates the CIDR / subnet-size pair.
fn validate(cidr: &str, subnet_size: Option<u8>) -> Result<(IpNetwork, u8), String> {
    let prefix: IpNetwork = cidr
        .parse()
        .map_err(|e| format!("invalid CIDR {cidr:?}: {e}"))?;
    let prefix = subnet::normalize(&prefix);
    let width = subnet::address_width(&prefix);
    let subnet_bits = subnet_size.unwrap_or(width);

    if subnet_bits < prefix.prefix() {
        return Err(format!(
            "subnet-size /{subnet_bits} must be at least the prefix length /{}",
            prefix.prefix()
        ));
    }
    if subnet_bits > width {
        return Err(format!(
            "subnet-size /{subnet_bits} is beyond the /{width} address width"
        ));
    }
    // Same boundary the dialer enforces: a pool of 2^64 subnets does not
    // fit the 64-bit index space.
    if subnet_bits - prefix.prefix() >= 64 {
        return Err(format!(
            "subnet pool too large: 2^{} subnets do not fit the 64-bit index space",
            subnet_bits - prefix.prefix()
        ));
    }
    Ok((prefix, subnet_bits))
}

/// `ip:port` passes through; a bare port binds all interfaces.
fn normalize_listen(listen: &str) -> String {
    if listen.contains(':') {
        listen.to_string()
    } else {
        format!("0.0.0.0:{listen}")
    }
}

/// Dials the echo service once per subnet and verifies the address it saw
/// matches the source the dialer picked. Fails if any request does.
async fn run_test(dialer: Arc<RandomIpDialer>) -> Result<(), Box<dyn std::error::Error>> {
    let total = dialer.subnet_count();
    let target = resolver::resolve(TEST_HOST, TEST_PORT, dialer.prefix().is_ipv6()).await?;
    info!("testing {total} egress addresses against {TEST_HOST} ({target})");

    let remaining = Arc::new(AtomicU64::new(total));
    let tested = Arc::new(AtomicU64::new(0));
    let failed = Arc::new(AtomicU64::new(0));

    let mut workers = Vec::new();
    for _ in 0..TEST_PARALLEL.min(total) {
        let dialer = dialer.clone();
        let remaining = remaining.clone();
        let tested = tested.clone();
        let failed = failed.clone();

        workers.push(tokio::spawn(async move {
            while remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
                .is_ok()
            {
                let (ip, dial) = match dialer.next_dial() {
                    Ok(next) => next,
                    Err(e) => {
                        error!("test failed to pick a source: {e}");
                        failed.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                };
                debug!("testing source IP {ip}");

                match tokio::time::timeout(TEST_TIMEOUT, probe(dial, target)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!("test failed for IP {ip}: {e}");
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(_) => {
                        error!("test failed for IP {ip}: timed out");
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                }

                let done = tested.fetch_add(1, Ordering::Relaxed) + 1;
                if done % 100 == 0 || done == total {
                    info!(
                        "tested {done}/{total}, failures: {}",
                        failed.load(Ordering::Relaxed)
                    );
                }
            }
        }));
    }
    for worker in workers {
        worker.await?;
    }

    let failures = failed.load(Ordering::Relaxed);
    if failures > 0 {
        return Err(format!("test finished with {failures}/{total} failures").into());
    }
    Ok(())
}

/// One HTTP request through the dial handle; the response body is the
/// address the echo service saw.
async fn probe(
    dial: EgressDial,
    target: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let conn = dial.connect(Transport::Tcp, target).await?;
    let mut stream = conn.into_tcp().ok_or("expected a TCP connection")?;

    let request = format!(
        "GET / HTTP/1.1\r\nHost: {TEST_HOST}\r\nUser-Agent: stargate-test\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    let text = String::from_utf8_lossy(&response);

    let status = text.lines().next().unwrap_or_default();
    if !status.contains(" 200 ") {
        return Err(format!("unexpected response status {status:?}").into());
    }

    let echoed = text
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .ok_or("empty response body")?
        .trim()
        .parse::<std::net::IpAddr>()?;

    if echoed != dial.source() {
        return Err(format!(
            "egressed from {echoed} instead of intended {}",
            dial.source()
        )
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_defaults_to_per_host_width() {
        let (prefix, bits) = validate("192.0.2.0/24", None).unwrap();
        assert_eq!(prefix, "192.0.2.0/24".parse::<IpNetwork>().unwrap());
        assert_eq!(bits, 32);

        let (_, bits) = validate("2001:db8::/48", None).unwrap();
        assert_eq!(bits, 128);
    }

    #[test]
    fn validate_normalizes_host_bits() {
        let (prefix, _) = validate("192.0.2.77/24", None).unwrap();
        assert_eq!(prefix, "192.0.2.0/24".parse::<IpNetwork>().unwrap());
    }

    #[test]
    fn validate_rejects_bad_input() {
        assert!(validate("not-a-cidr", None).is_err());
        assert!(validate("192.0.2.0/24", Some(16)).is_err());
        assert!(validate("192.0.2.0/24", Some(40)).is_err());
        // 63 extra bits is the largest pool that fits the index space;
        // 64 is the first that does not.
        assert!(validate("2001:db8::/32", Some(95)).is_ok());
        assert!(validate("2001:db8::/32", Some(96)).is_err());
        assert!(validate("2001:db8::/32", Some(97)).is_err());
    }

    #[test]
    fn listen_fixup() {
        assert_eq!(normalize_listen("127.0.0.1:1337"), "127.0.0.1:1337");
        assert_eq!(normalize_listen("[::1]:1080"), "[::1]:1080");
        assert_eq!(normalize_listen("9050"), "0.0.0.0:9050");
    }
}
