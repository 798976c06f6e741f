use std::net::IpAddr;
use std::time::Duration;

use anyhow::anyhow;
use bytes::{BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use chrono::{DateTime, Utc};

use crate::stats::latency_entry::LatencyEntry;
use crate::util::buf::{checked_get_i64, checked_get_u64, checked_get_u8, put_ip_addr, put_string, try_get_ip_addr, try_get_string};

/// One node's view of its peers, produced once per probing pass and shipped to the
///  aggregator.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct NodeSummary {
    pub source_node: String,
    pub entries: Vec<PeerLatency>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PeerLatency {
    pub peer_ip: IpAddr,
    pub latency: LatencyEntry,
}

const SUMMARY_FORMAT_VERSION: u8 = 1;

const ABSENT: u8 = 0;
const PRESENT: u8 = 1;

impl NodeSummary {
    pub fn empty(source_node: impl Into<String>) -> NodeSummary {
        NodeSummary {
            source_node: source_node.into(),
            entries: Vec::new(),
        }
    }

    pub fn get(&self, peer_ip: &IpAddr) -> Option<&LatencyEntry> {
        self.entries.iter()
            .find(|e| &e.peer_ip == peer_ip)
            .map(|e| &e.latency)
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(SUMMARY_FORMAT_VERSION);
        put_string(buf, &self.source_node);
        buf.put_usize_varint(self.entries.len());
        for entry in &self.entries {
            put_ip_addr(buf, &entry.peer_ip);
            Self::ser_timestamp(buf, entry.latency.last_send_time);
            Self::ser_timestamp(buf, entry.latency.last_recv_time);
            Self::ser_duration(buf, entry.latency.last_measured_rtt);
        }
    }

    //TODO &mut impl Buf
    pub fn deser(buf: &[u8]) -> anyhow::Result<NodeSummary> {
        let mut buf = buf;

        match checked_get_u8(&mut buf)? {
            SUMMARY_FORMAT_VERSION => {}
            v => return Err(anyhow!("unsupported summary format version {}", v)),
        }

        let source_node = try_get_string(&mut buf)?;
        let num_entries = buf.try_get_usize_varint()?;

        // every entry takes at least 8 bytes, so a corrupt count must not cause a huge allocation
        let mut entries = Vec::with_capacity(num_entries.min(buf.len() / 8));
        for _ in 0..num_entries {
            let peer_ip = try_get_ip_addr(&mut buf)?;
            let last_send_time = Self::deser_timestamp(&mut buf)?;
            let last_recv_time = Self::deser_timestamp(&mut buf)?;
            let last_measured_rtt = Self::deser_duration(&mut buf)?;
            entries.push(PeerLatency {
                peer_ip,
                latency: LatencyEntry {
                    last_send_time,
                    last_recv_time,
                    last_measured_rtt,
                },
            });
        }

        if !buf.is_empty() {
            return Err(anyhow!("{} trailing bytes after summary", buf.len()));
        }

        Ok(NodeSummary {
            source_node,
            entries,
        })
    }

    fn ser_timestamp(buf: &mut BytesMut, timestamp: Option<DateTime<Utc>>) {
        // timestamps outside the range of i64 nanos (years 1677 to 2262) are sent as absent
        match timestamp.and_then(|t| t.timestamp_nanos_opt()) {
            Some(nanos) => {
                buf.put_u8(PRESENT);
                buf.put_i64(nanos);
            }
            None => buf.put_u8(ABSENT),
        }
    }

    fn deser_timestamp(buf: &mut &[u8]) -> anyhow::Result<Option<DateTime<Utc>>> {
        match checked_get_u8(buf)? {
            ABSENT => Ok(None),
            PRESENT => Ok(Some(DateTime::from_timestamp_nanos(checked_get_i64(buf)?))),
            flag => Err(anyhow!("invalid presence flag {}", flag)),
        }
    }

    fn ser_duration(buf: &mut BytesMut, duration: Option<Duration>) {
        match duration {
            Some(d) => {
                buf.put_u8(PRESENT);
                buf.put_u64(d.as_nanos().try_into().unwrap_or(u64::MAX));
            }
            None => buf.put_u8(ABSENT),
        }
    }

    fn deser_duration(buf: &mut &[u8]) -> anyhow::Result<Option<Duration>> {
        match checked_get_u8(buf)? {
            ABSENT => Ok(None),
            PRESENT => Ok(Some(Duration::from_nanos(checked_get_u64(buf)?))),
            flag => Err(anyhow!("invalid presence flag {}", flag)),
        }
    }
}
