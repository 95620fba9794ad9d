//! Datagram I/O seam.
//!
//! The node speaks to the network through this trait so tests can swap the
//! real socket for an in-memory network with programmable loss.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;

/// An unreliable, unordered datagram transport.
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    /// Sends one datagram to the given address.
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;

    /// Receives one datagram, returning its length and source address.
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Returns the locally bound address.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// The production implementation over a UDP socket.
pub struct UdpDatagramSocket {
    inner: Arc<UdpSocket>,
}

impl UdpDatagramSocket {
    /// Binds a UDP socket at the given address.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let inner = Arc::new(UdpSocket::bind(addr).await?);
        Ok(Self { inner })
    }
}

#[async_trait]
impl DatagramSocket for UdpDatagramSocket {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.inner.send_to(buf, addr).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}
