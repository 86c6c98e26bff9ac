//! Kernel socket options used by the proxy.
//!
//! Two points of contact with the networking stack:
//! - `SO_ORIGINAL_DST` on an accepted, REDIRECT-ed socket to recover the
//!   address the client was trying to reach
//! - `SO_MARK` on the outbound socket, before connect, so every packet of the
//!   outbound flow carries the mark
//!
//! Both sit behind [`SocketOptions`] so the relay pipeline can run against a
//! stand-in where no NAT rules or `CAP_NET_ADMIN` are available.

use std::io;
use std::net::SocketAddrV4;

use tokio::net::{TcpSocket, TcpStream};

use crate::error::ProxyError;

pub trait SocketOptions: Send + Sync + 'static {
    /// Original (pre-redirect) destination of an accepted connection.
    ///
    /// Only IPv4 is supported; anything else is a resolution failure.
    fn original_destination(&self, inbound: &TcpStream) -> Result<SocketAddrV4, ProxyError>;

    /// Applies `mark` to a not yet connected outbound socket.
    fn set_mark(&self, outbound: &TcpSocket, mark: u32) -> Result<(), ProxyError>;
}

/// [`SocketOptions`] backed by the real kernel options.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelSocketOptions;

#[cfg(target_os = "linux")]
impl SocketOptions for KernelSocketOptions {
    fn original_destination(&self, inbound: &TcpStream) -> Result<SocketAddrV4, ProxyError> {
        let addr = socket2::SockRef::from(inbound)
            .original_dst()
            .map_err(ProxyError::Resolution)?;

        addr.as_socket_ipv4().ok_or_else(|| {
            ProxyError::Resolution(io::Error::new(
                io::ErrorKind::Unsupported,
                "original destination is not an IPv4 address",
            ))
        })
    }

    fn set_mark(&self, outbound: &TcpSocket, mark: u32) -> Result<(), ProxyError> {
        socket2::SockRef::from(outbound)
            .set_mark(mark)
            .map_err(|source| ProxyError::Mark { mark, source })
    }
}

#[cfg(not(target_os = "linux"))]
impl SocketOptions for KernelSocketOptions {
    fn original_destination(&self, _inbound: &TcpStream) -> Result<SocketAddrV4, ProxyError> {
        Err(ProxyError::Resolution(io::Error::new(
            io::ErrorKind::Unsupported,
            "SO_ORIGINAL_DST is only available on Linux",
        )))
    }

    fn set_mark(&self, _outbound: &TcpSocket, mark: u32) -> Result<(), ProxyError> {
        Err(ProxyError::Mark {
            mark,
            source: io::Error::new(
                io::ErrorKind::Unsupported,
                "SO_MARK is only available on Linux",
            ),
        })
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn direct_connection_resolves_to_itself_or_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();

        // Without conntrack there is nothing to query; with it, an un-NATed
        // connection reports its own destination, which is the listener.
        match KernelSocketOptions.original_destination(&accepted) {
            Ok(dst) => assert_eq!(std::net::SocketAddr::V4(dst), addr),
            Err(err) => assert!(matches!(err, ProxyError::Resolution(_))),
        }
    }

    #[tokio::test]
    async fn mark_error_carries_the_mark() {
        let socket = TcpSocket::new_v4().unwrap();
        // Succeeds with CAP_NET_ADMIN, EPERM without it.
        if let Err(err) = KernelSocketOptions.set_mark(&socket, 42) {
            assert!(matches!(err, ProxyError::Mark { mark: 42, .. }));
        }
    }
}
