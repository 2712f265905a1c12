//! Platform freebind socket options.
//!
//! Binding an egress socket to an address inside a routed-but-unconfigured
//! prefix needs kernel cooperation: Linux calls it `IP_FREEBIND`, FreeBSD
//! `IP_BINDANY`/`IPV6_BINDANY`. The option must be set on the raw fd before
//! `bind`. On platforms without an equivalent, `apply` is a no-op and the
//! bind itself fails with the OS error, so a wrong-source connection can
//! never happen silently.

use std::io;

use socket2::Socket;

#[cfg(any(target_os = "linux", target_os = "freebsd"))]
use std::os::unix::io::AsRawFd;

/// Returns true when this platform can bind to addresses that are not
/// configured on any local interface.
pub fn supported() -> bool {
    cfg!(any(target_os = "linux", target_os = "freebsd"))
}

/// Enables non-local binding on `socket`. Must run before `bind`.
#[cfg(target_os = "linux")]
pub fn apply(socket: &Socket, _ipv6: bool) -> io::Result<()> {
    // IP_FREEBIND at SOL_IP covers both address families.
    setsockopt_int(socket.as_raw_fd(), libc::SOL_IP, libc::IP_FREEBIND, 1)
}

#[cfg(target_os = "freebsd")]
pub fn apply(socket: &Socket, ipv6: bool) -> io::Result<()> {
    let fd = socket.as_raw_fd();
    if ipv6 {
        setsockopt_int(fd, libc::IPPROTO_IPV6, libc::IPV6_BINDANY, 1)
    } else {
        setsockopt_int(fd, libc::IPPROTO_IP, libc::IP_BINDANY, 1)
    }
}

#[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
pub fn apply(_socket: &Socket, _ipv6: bool) -> io::Result<()> {
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "freebsd"))]
fn setsockopt_int(fd: i32, level: i32, optname: i32, value: i32) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            optname,
            &value as *const i32 as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}
