use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::net::ip_family::IpFamily;

/// A datagram socket for ICMP messages of one address family. Buffers passed in and out contain
///  the ICMP message only, never an IP header.
///
/// Closing is the only way to stop a pending [PacketConn::recv_from]: once closed, pending and
///  future calls fail with [io::ErrorKind::NotConnected].
#[async_trait]
pub trait PacketConn: Send + Sync + 'static {
    async fn send_to(&self, buf: &[u8], to: IpAddr) -> io::Result<usize>;

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, IpAddr)>;

    fn close(&self);
}

#[async_trait]
pub trait SocketFactory: Send + Sync + 'static {
    async fn open(&self, family: IpFamily) -> anyhow::Result<Arc<dyn PacketConn>>;
}

pub fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "socket closed")
}

pub fn is_closed_error(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::NotConnected
}
