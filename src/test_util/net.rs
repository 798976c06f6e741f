use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex, RwLock};

use crate::net::ip_family::IpFamily;
use crate::net::packet_conn::{closed_error, PacketConn, SocketFactory};

/// In-memory [PacketConn]: records everything sent through it, and returns datagrams that were
///  injected by test code from `recv_from`.
pub struct FakePacketConn {
    sent: RwLock<Vec<(IpAddr, Vec<u8>)>>,
    inbound_sender: mpsc::UnboundedSender<io::Result<(Vec<u8>, IpAddr)>>,
    inbound: Mutex<mpsc::UnboundedReceiver<io::Result<(Vec<u8>, IpAddr)>>>,
    closed: watch::Sender<bool>,
    fail_sends: AtomicBool,
}
impl FakePacketConn {
    pub fn new() -> Arc<FakePacketConn> {
        let (inbound_sender, inbound) = mpsc::unbounded_channel();
        Arc::new(FakePacketConn {
            sent: Default::default(),
            inbound_sender,
            inbound: Mutex::new(inbound),
            closed: watch::Sender::new(false),
            fail_sends: AtomicBool::new(false),
        })
    }

    /// returns all datagrams sent so far, together with their destination
    pub async fn sent(&self) -> Vec<(IpAddr, Vec<u8>)> {
        self.sent.read().await.clone()
    }

    /// makes a datagram available to `recv_from`, as if it was received from `from`
    pub fn inject(&self, buf: &[u8], from: IpAddr) {
        // the receiver lives as long as self
        let _ = self.inbound_sender.send(Ok((buf.to_vec(), from)));
    }

    /// makes the next `recv_from` fail with `error`, after all datagrams injected before
    pub fn inject_error(&self, error: io::Error) {
        let _ = self.inbound_sender.send(Err(error));
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl PacketConn for FakePacketConn {
    async fn send_to(&self, buf: &[u8], to: IpAddr) -> io::Result<usize> {
        if self.is_closed() {
            return Err(closed_error());
        }
        if self.fail_sends.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "simulated send failure"));
        }
        self.sent.write().await.push((to, buf.to_vec()));
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, IpAddr)> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(closed_error());
        }

        let mut inbound = self.inbound.lock().await;
        let (datagram, from) = tokio::select! {
            d = inbound.recv() => match d {
                Some(d) => d?,
                None => return Err(closed_error()),
            },
            _ = closed.changed() => return Err(closed_error()),
        };

        // like a datagram socket, silently truncate to the buffer's size
        let len = datagram.len().min(buf.len());
        buf[..len].copy_from_slice(&datagram[..len]);
        Ok((len, from))
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }
}

/// [SocketFactory] handing out [FakePacketConn]s and keeping track of them. Opening can be made to
///  fail per address family.
#[derive(Default)]
pub struct FakeSocketFactory {
    opened: RwLock<Vec<(IpFamily, Arc<FakePacketConn>)>>,
    fail_v4: AtomicBool,
    fail_v6: AtomicBool,
}
impl FakeSocketFactory {
    pub fn new() -> Arc<FakeSocketFactory> {
        Default::default()
    }

    pub fn set_fail(&self, family: IpFamily, fail: bool) {
        self.fail_flag(family).store(fail, Ordering::Release);
    }

    fn fail_flag(&self, family: IpFamily) -> &AtomicBool {
        match family {
            IpFamily::V4 => &self.fail_v4,
            IpFamily::V6 => &self.fail_v6,
        }
    }

    /// all sockets of a family that were ever opened, in the order they were opened
    pub async fn opened(&self, family: IpFamily) -> Vec<Arc<FakePacketConn>> {
        self.opened.read().await
            .iter()
            .filter(|(f, _)| *f == family)
            .map(|(_, conn)| conn.clone())
            .collect()
    }

    pub async fn num_open(&self, family: IpFamily) -> usize {
        self.opened(family).await
            .iter()
            .filter(|conn| !conn.is_closed())
            .count()
    }
}

#[async_trait]
impl SocketFactory for FakeSocketFactory {
    async fn open(&self, family: IpFamily) -> anyhow::Result<Arc<dyn PacketConn>> {
        if self.fail_flag(family).load(Ordering::Acquire) {
            return Err(anyhow::anyhow!("simulated failure opening {} socket", family));
        }
        let conn = FakePacketConn::new();
        self.opened.write().await.push((family, conn.clone()));
        Ok(conn)
    }
}
