//! Thin socket helpers over socket2.

use std::net::SocketAddr;

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tracing::warn;

use crate::error::Error;

/// Creates a non-blocking, close-on-exec TCP socket bound to `addr`, with
/// `SO_REUSEADDR` and optionally `SO_REUSEPORT` set. The kernel listen is
/// issued separately, by the acceptor.
pub(crate) fn bind_listen_socket(addr: SocketAddr, reuse_port: bool) -> Result<Socket, Error> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(
        domain,
        Type::STREAM.nonblocking().cloexec(),
        Some(Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.bind(&addr.into())?;
    Ok(socket)
}

/// Enables `SO_KEEPALIVE` on an accepted stream. Failure is logged, not
/// fatal: the connection works without it.
pub(crate) fn set_keepalive(stream: &mio::net::TcpStream, on: bool) {
    if let Err(err) = SockRef::from(stream).set_keepalive(on) {
        warn!(?err, "failed to set SO_KEEPALIVE");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_resolves_ephemeral_port() {
        let socket = bind_listen_socket("127.0.0.1:0".parse().unwrap(), false)
            .expect("failed to bind listen socket");
        let addr = socket
            .local_addr()
            .unwrap()
            .as_socket()
            .expect("not an inet address");
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn reuse_port_socket_binds() {
        let socket = bind_listen_socket("127.0.0.1:0".parse().unwrap(), true)
            .expect("failed to bind reuse-port socket");
        assert!(socket.local_addr().is_ok());
    }
}
