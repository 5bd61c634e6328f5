//! UDP ingress socket creation with SO_REUSEPORT.

use crate::netio::config::NetIoConfig;
use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket as Socket2, Type};
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

/// Create and bind a UDP ingress socket.
///
/// The socket is blocking with a read timeout of `poll_timeout_ms`, so a
/// worker waiting for frames wakes up regularly to check for shutdown.
///
/// With SO_REUSEPORT enabled the kernel distributes datagrams across all
/// sockets bound to the same port.
pub fn create_udp_socket(bind_addr: SocketAddr, config: &NetIoConfig) -> Result<UdpSocket> {
    let domain = match bind_addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };

    let socket =
        Socket2::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("creating UDP socket")?;

    socket
        .set_reuse_address(true)
        .context("setting SO_REUSEADDR")?;

    if config.reuse_port {
        configure_reuse_port(&socket).context("setting SO_REUSEPORT")?;
    }

    if let Some(size) = config.socket_recv_buffer_size {
        socket
            .set_recv_buffer_size(size)
            .with_context(|| format!("setting SO_RCVBUF to {}", size))?;
    }

    if let Some(size) = config.socket_send_buffer_size {
        socket
            .set_send_buffer_size(size)
            .with_context(|| format!("setting SO_SNDBUF to {}", size))?;
    }

    if let SocketAddr::V6(addr) = bind_addr {
        socket
            .set_only_v6(!addr.ip().is_unspecified())
            .context("setting IPV6_V6ONLY")?;
    }

    socket
        .set_read_timeout(Some(Duration::from_millis(config.poll_timeout_ms)))
        .context("setting SO_RCVTIMEO")?;

    socket
        .bind(&bind_addr.into())
        .with_context(|| format!("binding UDP socket to {}", bind_addr))?;

    Ok(socket.into())
}

/// Configure SO_REUSEPORT on supported platforms.
#[cfg(unix)]
fn configure_reuse_port(socket: &Socket2) -> std::io::Result<()> {
    match socket.set_reuse_port(true) {
        Ok(()) => Ok(()),
        Err(err) => match err.raw_os_error() {
            Some(libc::ENOPROTOOPT) | Some(libc::EINVAL) => {
                tracing::warn!("SO_REUSEPORT not supported on this platform");
                Ok(())
            }
            _ => Err(err),
        },
    }
}

/// Stub for platforms that don't support SO_REUSEPORT
#[cfg(not(unix))]
fn configure_reuse_port(_socket: &Socket2) -> std::io::Result<()> {
    tracing::warn!("SO_REUSEPORT not available on this platform");
    Ok(())
}
