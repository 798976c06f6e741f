use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, trace, warn};

use crate::monitor::latency_store::LatencyStore;
use crate::net::icmp::{EchoKind, EchoMessage, IcmpMessage};
use crate::net::ip_family::IpFamily;
use crate::net::packet_conn::{is_closed_error, PacketConn};

/// Sends ICMP echo requests and turns echo replies into latency entries.
///
/// There is no table of outstanding requests: each request carries its send time as payload, and
///  a reply is attributed to the address it came from. The price is that only the latest probe per
///  peer is tracked - a late reply to an older probe is indistinguishable from a reply to the
///  newest one.
pub struct PingEngine {
    store: Arc<LatencyStore>,
    identifier: u16,
    sequence: AtomicU16,
}

impl PingEngine {
    pub fn new(store: Arc<LatencyStore>) -> PingEngine {
        PingEngine {
            store,
            identifier: std::process::id() as u16,
            sequence: AtomicU16::new(0),
        }
    }

    pub fn identifier(&self) -> u16 {
        self.identifier
    }

    /// wraps around silently; sequence numbers only help reading packet captures, replies are
    ///  correlated by peer address
    pub fn next_sequence(&self) -> u16 {
        self.sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    pub async fn send_ping(&self, conn: &dyn PacketConn, target: IpAddr) -> anyhow::Result<()> {
        let target = target.to_canonical();
        let family = IpFamily::of(&target);

        let send_time = Utc::now();
        let request = EchoMessage {
            kind: EchoKind::Request,
            identifier: self.identifier,
            sequence: self.next_sequence(),
            payload: Bytes::from(encode_timestamp(&send_time)),
        };

        let mut buf = BytesMut::new();
        request.ser(family, &mut buf);
        conn.send_to(&buf, target).await
            .with_context(|| format!("sending ICMP echo request to {}", target))?;
        trace!("sent echo request #{} to {}", request.sequence, target);

        self.store.set(target, |e| e.last_send_time = Some(send_time)).await;
        Ok(())
    }

    /// Reads datagrams until reading fails. Closing the socket is the regular way to end the loop.
    pub async fn receive_loop(&self, conn: Arc<dyn PacketConn>, family: IpFamily, buffer_size: usize) {
        debug!("starting {} receive loop", family);

        let mut buf = vec![0u8; buffer_size];
        loop {
            match conn.recv_from(&mut buf).await {
                Ok((len, peer)) => {
                    if let Err(e) = self.on_datagram(&buf[..len], peer, family).await {
                        warn!("discarding ICMP datagram from {}: {}", peer, e);
                    }
                }
                Err(e) if is_closed_error(&e) => {
                    debug!("{} socket was closed - ending receive loop", family);
                    break;
                }
                Err(e) => {
                    warn!("error reading from {} socket - ending receive loop: {}", family, e);
                    break;
                }
            }
        }
    }

    /// Handles a single received ICMP datagram. Anything but an echo reply is ignored; an echo
    ///  reply with a payload that is not a send timestamp is an error and leaves the store
    ///  unchanged.
    pub async fn on_datagram(&self, buf: &[u8], peer: IpAddr, family: IpFamily) -> anyhow::Result<()> {
        let reply = match IcmpMessage::deser(family, buf)? {
            IcmpMessage::Echo(echo) if echo.kind == EchoKind::Reply => echo,
            other => {
                trace!("ignoring ICMP message from {}: {:?}", peer, other);
                return Ok(());
            }
        };

        let send_time = decode_timestamp(&reply.payload)?;
        let recv_time = Utc::now();
        let rtt = match (recv_time - send_time).to_std() {
            Ok(rtt) => rtt,
            Err(_) => {
                warn!("system clock apparently went backwards - reply from {} arrived before it was sent", peer);
                Duration::ZERO
            }
        };
        trace!("echo reply #{} from {}: rtt={:?}", reply.sequence, peer, rtt);

        self.store.set(peer, |e| {
            e.last_send_time = Some(send_time);
            e.last_recv_time = Some(recv_time);
            e.last_measured_rtt = Some(rtt);
        }).await;
        Ok(())
    }
}

/// RFC 3339 with nanoseconds in UTC: sorts lexicographically, and parses back without loss
pub fn encode_timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn decode_timestamp(buf: &[u8]) -> anyhow::Result<DateTime<Utc>> {
    let s = std::str::from_utf8(buf)
        .context("echo payload is not UTF-8")?;
    let t = DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("echo payload is not a timestamp: {:?}", s))?;
    Ok(t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use bytes::{Bytes, BytesMut};
    use chrono::{TimeDelta, Utc};
    use rstest::rstest;
    use crate::monitor::latency_store::LatencyStore;
    use crate::monitor::ping_engine::*;
    use crate::net::icmp::{EchoKind, EchoMessage, IcmpMessage};
    use crate::net::ip_family::IpFamily;
    use crate::net::packet_conn::PacketConn;
    use crate::test_util::net::FakePacketConn;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn engine() -> (Arc<LatencyStore>, PingEngine) {
        let store = Arc::new(LatencyStore::new());
        let engine = PingEngine::new(store.clone());
        (store, engine)
    }

    fn reply_datagram(family: IpFamily, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        EchoMessage {
            kind: EchoKind::Reply,
            identifier: 1,
            sequence: 1,
            payload: Bytes::copy_from_slice(payload),
        }.ser(family, &mut buf);
        buf.to_vec()
    }

    /// turns a sent echo request into the reply a peer would send back
    fn echo_back(family: IpFamily, request: &[u8]) -> Vec<u8> {
        match IcmpMessage::deser(family, request).unwrap() {
            IcmpMessage::Echo(mut echo) => {
                assert_eq!(echo.kind, EchoKind::Request);
                echo.kind = EchoKind::Reply;
                let mut buf = BytesMut::new();
                echo.ser(family, &mut buf);
                buf.to_vec()
            }
            other => panic!("not an echo message: {:?}", other),
        }
    }

    #[test]
    fn test_next_sequence_wraps() {
        let (_, engine) = engine();
        let first = engine.next_sequence();
        assert_eq!(first, 1);

        let mut prev = first;
        for _ in 1..65536 {
            let next = engine.next_sequence();
            assert_eq!(next, prev.wrapping_add(1));
            prev = next;
        }
        assert_eq!(prev, 0);
        assert_eq!(engine.next_sequence(), first);
    }

    #[tokio::test]
    async fn test_send_ping_creates_entry() {
        let (store, engine) = engine();
        let conn = FakePacketConn::new();

        let before = Utc::now();
        engine.send_ping(conn.as_ref(), ip("10.0.0.2")).await.unwrap();

        let entry = store.get(&ip("10.0.0.2")).await.unwrap();
        let sent = entry.last_send_time.unwrap();
        assert!(sent >= before);
        assert_eq!(entry.last_recv_time, None);
        assert_eq!(entry.last_measured_rtt, None);

        let datagrams = conn.sent().await;
        assert_eq!(datagrams.len(), 1);
        assert_eq!(datagrams[0].0, ip("10.0.0.2"));
        match IcmpMessage::deser(IpFamily::V4, &datagrams[0].1).unwrap() {
            IcmpMessage::Echo(echo) => {
                assert_eq!(echo.kind, EchoKind::Request);
                assert_eq!(echo.identifier, engine.identifier());
                assert_eq!(decode_timestamp(&echo.payload).unwrap(), sent);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_ping_failure_records_nothing() {
        let (store, engine) = engine();
        let conn = FakePacketConn::new();
        conn.set_fail_sends(true);

        assert!(engine.send_ping(conn.as_ref(), ip("10.0.0.2")).await.is_err());
        assert!(store.get(&ip("10.0.0.2")).await.is_none());
    }

    #[rstest]
    #[case::v4("127.0.0.1", IpFamily::V4)]
    #[case::v6("::1", IpFamily::V6)]
    #[tokio::test]
    async fn test_round_trip(#[case] peer: &str, #[case] family: IpFamily) {
        let (store, engine) = engine();
        let conn = FakePacketConn::new();
        let peer = ip(peer);

        engine.send_ping(conn.as_ref(), peer).await.unwrap();
        let t0 = store.get(&peer).await.unwrap().last_send_time.unwrap();

        let request = conn.sent().await.remove(0).1;
        engine.on_datagram(&echo_back(family, &request), peer, family).await.unwrap();

        let entry = store.get(&peer).await.unwrap();
        assert_eq!(entry.last_send_time, Some(t0));
        let t1 = entry.last_recv_time.unwrap();
        assert!(t1 >= t0);
        assert_eq!(entry.last_measured_rtt, Some((t1 - t0).to_std().unwrap()));
    }

    #[rstest]
    #[case::not_a_timestamp(b"hello".to_vec())]
    #[case::not_utf8(vec![0xff, 0xfe])]
    #[case::empty(vec![])]
    #[tokio::test]
    async fn test_malformed_payload_leaves_entry_unchanged(#[case] payload: Vec<u8>) {
        let (store, engine) = engine();
        let peer = ip("10.0.0.2");
        store.set(peer, |e| e.last_measured_rtt = Some(Duration::from_millis(7))).await;
        let before = store.get(&peer).await;

        let result = engine.on_datagram(&reply_datagram(IpFamily::V4, &payload), peer, IpFamily::V4).await;
        assert!(result.is_err());
        assert_eq!(store.get(&peer).await, before);
    }

    #[tokio::test]
    async fn test_ignores_echo_requests() {
        let (store, engine) = engine();
        let mut buf = BytesMut::new();
        EchoMessage {
            kind: EchoKind::Request,
            identifier: 1,
            sequence: 1,
            payload: Bytes::from(encode_timestamp(&Utc::now())),
        }.ser(IpFamily::V4, &mut buf);

        engine.on_datagram(&buf, ip("10.0.0.2"), IpFamily::V4).await.unwrap();
        assert!(store.get(&ip("10.0.0.2")).await.is_none());
    }

    #[tokio::test]
    async fn test_ignores_other_icmp() {
        let (store, engine) = engine();
        // destination unreachable
        engine.on_datagram(&[3, 1, 0xfc, 0xfe, 0, 0, 0, 0], ip("10.0.0.2"), IpFamily::V4).await.unwrap();
        assert!(store.get(&ip("10.0.0.2")).await.is_none());
    }

    #[tokio::test]
    async fn test_reply_from_the_future_has_zero_rtt() {
        let (store, engine) = engine();
        let future = Utc::now() + TimeDelta::hours(1);
        let payload = encode_timestamp(&future);

        engine.on_datagram(&reply_datagram(IpFamily::V4, payload.as_bytes()), ip("10.0.0.2"), IpFamily::V4).await.unwrap();
        let entry = store.get(&ip("10.0.0.2")).await.unwrap();
        assert_eq!(entry.last_measured_rtt, Some(Duration::ZERO));
        assert_eq!(entry.last_send_time, Some(future));
    }

    #[test]
    fn test_timestamp_encoding() {
        let t = chrono::DateTime::from_timestamp_nanos(1_700_000_000_123_456_789);
        let encoded = encode_timestamp(&t);
        assert_eq!(encoded, "2023-11-14T22:13:20.123456789Z");
        assert_eq!(decode_timestamp(encoded.as_bytes()).unwrap(), t);
    }

    #[tokio::test]
    async fn test_receive_loop() {
        let (store, engine) = engine();
        let engine = Arc::new(engine);
        let conn = FakePacketConn::new();

        let handle = {
            let engine = engine.clone();
            let conn: Arc<dyn PacketConn> = conn.clone();
            tokio::spawn(async move { engine.receive_loop(conn, IpFamily::V4, 256).await })
        };

        conn.inject(&reply_datagram(IpFamily::V4, b"garbage"), ip("10.0.0.3"));
        conn.inject(&reply_datagram(IpFamily::V4, encode_timestamp(&Utc::now()).as_bytes()), ip("10.0.0.2"));

        tokio::time::timeout(Duration::from_secs(5), async {
            while store.get(&ip("10.0.0.2")).await.is_none() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }).await.unwrap();
        assert!(store.get(&ip("10.0.0.3")).await.is_none());

        conn.close();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }
}
