use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::net::ip_family::IpFamily;
use crate::net::packet_conn::{closed_error, PacketConn, SocketFactory};

/// A raw ICMP socket (requires CAP_NET_RAW or root), bound to the wildcard address and driven by
///  tokio's reactor.
pub struct RawIcmpSocket {
    family: IpFamily,
    socket: UdpSocket,
    closed: watch::Sender<bool>,
}

impl RawIcmpSocket {
    pub fn open(family: IpFamily) -> anyhow::Result<RawIcmpSocket> {
        let (domain, protocol) = match family {
            IpFamily::V4 => (Domain::IPV4, Protocol::ICMPV4),
            IpFamily::V6 => (Domain::IPV6, Protocol::ICMPV6),
        };

        let socket = Socket::new(domain, Type::RAW, Some(protocol))
            .with_context(|| format!("opening raw {} ICMP socket", family))?;
        socket.set_nonblocking(true)?;

        // tokio has no raw socket type, but datagram semantics are all that is needed
        let socket = UdpSocket::from_std(socket.into())?;

        info!("opened raw {} ICMP socket", family);
        Ok(RawIcmpSocket {
            family,
            socket,
            closed: watch::Sender::new(false),
        })
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl PacketConn for RawIcmpSocket {
    async fn send_to(&self, buf: &[u8], to: IpAddr) -> io::Result<usize> {
        if self.is_closed() {
            return Err(closed_error());
        }
        self.socket.send_to(buf, SocketAddr::new(to, 0)).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, IpAddr)> {
        let mut closed = self.closed.subscribe();

        loop {
            let (len, from) = tokio::select! {
                r = self.socket.recv_from(&mut *buf) => r?,
                _ = wait_until_closed(&mut closed) => return Err(closed_error()),
            };

            // IPv4 raw sockets deliver the IP header along with the payload, IPv6 raw sockets don't
            if self.family == IpFamily::V6 {
                return Ok((len, from.ip()));
            }
            match strip_ipv4_header(buf, len) {
                Ok(len) => return Ok((len, from.ip())),
                Err(e) => warn!("discarding IPv4 datagram from {}: {}", from.ip(), e),
            }
        }
    }

    fn close(&self) {
        if !self.closed.send_replace(true) {
            debug!("closing raw {} ICMP socket", self.family);
        }
    }
}

/// Moves the payload of a raw IPv4 datagram to the start of `buf` and returns its length.
fn strip_ipv4_header(buf: &mut [u8], len: usize) -> anyhow::Result<usize> {
    let len = len.min(buf.len());
    if len < MIN_IPV4_HEADER_LEN {
        return Err(anyhow!("truncated IPv4 header: {} bytes", len));
    }

    let header_len = ((buf[0] & 0x0f) as usize) * 4;
    if header_len < MIN_IPV4_HEADER_LEN || header_len > len {
        return Err(anyhow!("invalid IPv4 header length {} in a datagram of {} bytes", header_len, len));
    }

    buf.copy_within(header_len..len, 0);
    Ok(len - header_len)
}

const MIN_IPV4_HEADER_LEN: usize = 20;

async fn wait_until_closed(closed: &mut watch::Receiver<bool>) {
    loop {
        let is_closed = *closed.borrow_and_update();
        if is_closed {
            return;
        }
        if closed.changed().await.is_err() {
            return;
        }
    }
}

pub struct RawSocketFactory;

#[async_trait]
impl SocketFactory for RawSocketFactory {
    async fn open(&self, family: IpFamily) -> anyhow::Result<Arc<dyn PacketConn>> {
        Ok(Arc::new(RawIcmpSocket::open(family)?))
    }
}
