//! OS socket construction shared by connections and listeners.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::trace;

use crate::config::{ConnectionOptions, ListenerOptions, ProtectionLevel};

/// Options applied to a freshly created socket.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SocketSettings {
    pub exclusive_address_use: bool,
    pub no_delay: bool,
    pub use_timestamps: bool,
    pub protection_level: ProtectionLevel,
    pub user_timeout: Option<Duration>,
}

impl From<&ConnectionOptions> for SocketSettings {
    fn from(options: &ConnectionOptions) -> Self {
        let timeout = options.connection_timeout();
        Self {
            exclusive_address_use: options.exclusive_address_use,
            no_delay: options.no_delay,
            use_timestamps: options.use_timestamps,
            protection_level: options.protection_level,
            user_timeout: (!timeout.is_zero()).then_some(timeout),
        }
    }
}

impl From<&ListenerOptions> for SocketSettings {
    fn from(options: &ListenerOptions) -> Self {
        Self {
            exclusive_address_use: options.exclusive_address_use,
            no_delay: options.no_delay,
            use_timestamps: options.use_timestamps,
            protection_level: options.protection_level,
            user_timeout: None,
        }
    }
}

/// Create a TCP socket for `addr`'s family, configure it and bind it.
///
/// Returns the socket together with the address the OS actually assigned.
pub(crate) fn bind_stream_socket(
    addr: SocketAddr,
    settings: &SocketSettings,
) -> io::Result<(Socket, SocketAddr)> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    apply(&socket, settings)?;
    socket.bind(&SockAddr::from(addr))?;
    let local = inet_addr(socket.local_addr()?)?;
    Ok((socket, local))
}

fn apply(socket: &Socket, settings: &SocketSettings) -> io::Result<()> {
    socket.set_reuse_address(!settings.exclusive_address_use)?;
    socket.set_nodelay(settings.no_delay)?;

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "fuchsia"))]
    if let Some(timeout) = settings.user_timeout {
        socket.set_tcp_user_timeout(Some(timeout))?;
    }

    // Neither has a per-socket knob on the platforms we build for.
    if settings.use_timestamps || settings.protection_level != ProtectionLevel::Unrestricted {
        trace!(
            use_timestamps = settings.use_timestamps,
            protection_level = ?settings.protection_level,
            "Socket option recorded only"
        );
    }
    Ok(())
}

fn inet_addr(addr: SockAddr) -> io::Result<SocketAddr> {
    addr.as_socket()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "socket has no inet address"))
}

/// Whether a non-blocking connect was accepted and will finish later.
pub(crate) fn connect_in_progress(err: &io::Error) -> bool {
    #[cfg(unix)]
    if err.raw_os_error() == Some(libc::EINPROGRESS) {
        return true;
    }
    err.kind() == io::ErrorKind::WouldBlock
}

/// Accept failures caused by the remote side giving up before we got to it.
pub(crate) fn is_peer_abort(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
    )
}

/// Loopback address of the default (IPv4) family.
pub(crate) fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// Local address used when a connect has to bind implicitly.
pub(crate) fn implicit_bind_addr(remote: &SocketAddr) -> SocketAddr {
    match remote {
        SocketAddr::V4(v4) if v4.ip().is_loopback() => loopback(0),
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(v6) if v6.ip().is_loopback() => SocketAddr::from((Ipv6Addr::LOCALHOST, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> SocketSettings {
        SocketSettings::from(&ConnectionOptions::default())
    }

    #[test]
    fn test_bind_assigns_ephemeral_port() {
        let (socket, local) = bind_stream_socket(loopback(0), &settings()).unwrap();
        assert!(local.ip().is_loopback());
        assert_ne!(local.port(), 0);
        assert!(socket.nodelay().unwrap());
    }

    #[test]
    fn test_exclusive_address_use_disables_reuse() {
        let mut s = settings();
        s.exclusive_address_use = false;
        let (shared, _) = bind_stream_socket(loopback(0), &s).unwrap();
        assert!(shared.reuse_address().unwrap());

        s.exclusive_address_use = true;
        let (exclusive, _) = bind_stream_socket(loopback(0), &s).unwrap();
        assert!(!exclusive.reuse_address().unwrap());
    }

    #[test]
    fn test_connect_timeout_maps_to_user_timeout() {
        let mut options = ConnectionOptions::default();
        assert!(SocketSettings::from(&options).user_timeout.is_some());
        options.connection_timeout_secs = 0;
        assert!(SocketSettings::from(&options).user_timeout.is_none());
        assert!(SocketSettings::from(&ListenerOptions::default()).user_timeout.is_none());
    }

    #[test]
    fn test_error_classification() {
        assert!(connect_in_progress(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(!connect_in_progress(&io::Error::from(io::ErrorKind::ConnectionRefused)));
        #[cfg(unix)]
        assert!(connect_in_progress(&io::Error::from_raw_os_error(libc::EINPROGRESS)));

        assert!(is_peer_abort(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_peer_abort(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(!is_peer_abort(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[test]
    fn test_implicit_bind_follows_remote_family() {
        let v4 = implicit_bind_addr(&"10.0.0.1:80".parse().unwrap());
        assert!(v4.is_ipv4() && v4.ip().is_unspecified());
        let lo = implicit_bind_addr(&"127.0.0.1:80".parse().unwrap());
        assert!(lo.ip().is_loopback());
        let v6 = implicit_bind_addr(&"[::1]:80".parse().unwrap());
        assert!(v6.is_ipv6() && v6.ip().is_loopback());
    }
}
