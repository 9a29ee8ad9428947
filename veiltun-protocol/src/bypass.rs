//! Socket bypass registry.
//!
//! On platforms where the VPN owns the default route, any socket this
//! process opens would be routed straight back into its own TUN. The host
//! environment installs a predicate (VpnService.protect on Android, a
//! policy-routing mark elsewhere) that exempts a file descriptor from the
//! tunnel; every outbound TCP and UDP socket the data plane creates is
//! passed through it before use.

use parking_lot::RwLock;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

#[cfg(unix)]
use std::os::unix::io::{AsRawFd, RawFd};
#[cfg(not(unix))]
pub type RawFd = i32;

/// Host-provided predicate: returns true when platform routing will carry
/// this socket past the TUN.
pub type BypassFn = std::sync::Arc<dyn Fn(RawFd) -> bool + Send + Sync>;

static BYPASS_CALLBACK: RwLock<Option<BypassFn>> = RwLock::new(None);

pub fn set_bypass(callback: BypassFn) {
    let mut guard = BYPASS_CALLBACK.write();
    *guard = Some(callback);
    info!("Socket bypass callback registered");
}

pub fn clear_bypass() {
    let mut guard = BYPASS_CALLBACK.write();
    *guard = None;
    info!("Socket bypass callback cleared");
}

pub fn has_bypass() -> bool {
    BYPASS_CALLBACK.read().is_some()
}

/// Run the predicate on a descriptor. A false return is logged but never
/// aborts the connection; without a callback the socket is allowed through.
pub fn apply_bypass(fd: RawFd) -> bool {
    let guard = BYPASS_CALLBACK.read();
    if let Some(ref callback) = *guard {
        let result = callback(fd);
        if result {
            debug!("Socket fd={} bypassed from tunnel", fd);
        } else {
            warn!("Bypass FAILED for socket fd={}, traffic may loop", fd);
        }
        result
    } else {
        debug!("No bypass callback set for fd={}, allowing", fd);
        true
    }
}

/// Open a TCP connection whose socket has been offered to the bypass
/// predicate before the connect syscall.
#[cfg(unix)]
pub async fn connect_bypassed(addr: &str, timeout: Duration) -> std::io::Result<tokio::net::TcpStream> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket_addr: SocketAddr = tokio::net::lookup_host(addr).await?.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve address: {}", addr),
        )
    })?;

    let domain = if socket_addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    apply_bypass(socket.as_raw_fd());

    socket.set_nonblocking(true)?;
    match socket.connect(&socket_addr.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }

    let std_stream: std::net::TcpStream = socket.into();
    let stream = tokio::net::TcpStream::from_std(std_stream)?;

    tokio::time::timeout(timeout, stream.writable())
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "Connection timeout"))??;

    if let Some(e) = stream.take_error()? {
        return Err(e);
    }

    Ok(stream)
}

#[cfg(not(unix))]
pub async fn connect_bypassed(addr: &str, timeout: Duration) -> std::io::Result<tokio::net::TcpStream> {
    tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "Connection timeout"))?
}

/// Bind an ephemeral outbound datagram socket, bypassed and non-blocking.
#[cfg(unix)]
pub fn bind_bypassed_udp() -> std::io::Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    apply_bypass(socket.as_raw_fd());

    socket.set_nonblocking(true)?;
    let bind_addr: SocketAddr = "0.0.0.0:0".parse().expect("static addr");
    socket.bind(&bind_addr.into())?;

    Ok(socket.into())
}

#[cfg(not(unix))]
pub fn bind_bypassed_udp() -> std::io::Result<std::net::UdpSocket> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}
