//! Abstract datagram transport.
//!
//! The [`Transport`] trait lets the connection machinery run over any async
//! datagram carrier. Production code uses [`UdpTransport`] backed by
//! `tokio::net::UdpSocket`; tests can substitute an in-memory or lossy
//! implementation without touching the protocol.

use std::fmt::{Debug, Display};
use std::future::Future;
use std::hash::Hash;
use std::io;

/// Marker trait for address types used by [`Transport`] implementations.
///
/// Any type satisfying the bounds implements `Addr` via the blanket impl,
/// which keeps bound lists short elsewhere.
pub trait Addr: Clone + Eq + Hash + Send + Sync + Debug + Display + Unpin + 'static {}

impl<T: Clone + Eq + Hash + Send + Sync + Debug + Display + Unpin + 'static> Addr for T {}

/// Async datagram transport used by [`TetherStream`](crate::stream::TetherStream)
/// and [`TetherListener`](crate::listener::TetherListener).
///
/// Implementors provide unconnected send/receive addressed by an associated
/// [`Addr`] type. Datagram semantics are assumed: whole packets in, whole
/// packets out, silent loss allowed.
pub trait Transport: Send + Sync + 'static {
    /// The address type identifying remote endpoints.
    type Addr: Addr;

    /// Send `buf` as one datagram to `target`, returning bytes written.
    fn send_to<'a>(
        &'a self,
        buf: &'a [u8],
        target: &'a Self::Addr,
    ) -> impl Future<Output = io::Result<usize>> + Send + 'a;

    /// Receive one datagram into `buf`, returning `(bytes_read, source)`.
    fn recv_from<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = io::Result<(usize, Self::Addr)>> + Send + 'a;

    /// The local address this transport is bound to.
    fn local_addr(&self) -> io::Result<Self::Addr>;
}

// ---------------------------------------------------------------------------
// UdpTransport: default implementation backed by tokio::net::UdpSocket
// ---------------------------------------------------------------------------

mod udp {
    use super::*;
    use std::net::SocketAddr;
    use tokio::net::UdpSocket;

    /// Default [`Transport`] wrapping a `tokio::net::UdpSocket`.
    pub struct UdpTransport {
        socket: UdpSocket,
    }

    impl UdpTransport {
        /// Bind a new UDP socket to `addr`.
        pub async fn bind(addr: impl tokio::net::ToSocketAddrs) -> io::Result<Self> {
            let socket = UdpSocket::bind(addr).await?;
            Ok(Self { socket })
        }

        /// Wrap an already-configured `UdpSocket`.
        pub fn new(socket: UdpSocket) -> Self {
            Self { socket }
        }
    }

    impl Transport for UdpTransport {
        type Addr = SocketAddr;

        async fn send_to(&self, buf: &[u8], target: &SocketAddr) -> io::Result<usize> {
            self.socket.send_to(buf, target).await
        }

        async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            self.socket.recv_from(buf).await
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            self.socket.local_addr()
        }
    }
}

pub use udp::UdpTransport;
