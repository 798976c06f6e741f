use anyhow::anyhow;
use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::net::ip_family::IpFamily;
use crate::util::buf::{checked_get_u16, checked_get_u8};

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum Icmpv4Type {
    EchoReply = 0,
    EchoRequest = 8,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum Icmpv6Type {
    EchoRequest = 128,
    EchoReply = 129,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EchoKind {
    Request,
    Reply,
}
impl EchoKind {
    pub fn icmp_type(&self, family: IpFamily) -> u8 {
        match (family, self) {
            (IpFamily::V4, EchoKind::Request) => Icmpv4Type::EchoRequest.into(),
            (IpFamily::V4, EchoKind::Reply) => Icmpv4Type::EchoReply.into(),
            (IpFamily::V6, EchoKind::Request) => Icmpv6Type::EchoRequest.into(),
            (IpFamily::V6, EchoKind::Reply) => Icmpv6Type::EchoReply.into(),
        }
    }

    fn from_icmp_type(family: IpFamily, icmp_type: u8) -> Option<EchoKind> {
        match family {
            IpFamily::V4 => match Icmpv4Type::try_from(icmp_type).ok()? {
                Icmpv4Type::EchoRequest => Some(EchoKind::Request),
                Icmpv4Type::EchoReply => Some(EchoKind::Reply),
            },
            IpFamily::V6 => match Icmpv6Type::try_from(icmp_type).ok()? {
                Icmpv6Type::EchoRequest => Some(EchoKind::Request),
                Icmpv6Type::EchoReply => Some(EchoKind::Reply),
            },
        }
    }
}

/// An ICMP echo request or reply (RFC 792 / RFC 4443): type, code, checksum, identifier,
///  sequence number and an opaque payload
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct EchoMessage {
    pub kind: EchoKind,
    pub identifier: u16,
    pub sequence: u16,
    pub payload: Bytes,
}

impl EchoMessage {
    /// For IPv4 the checksum is calculated here. For IPv6 it covers a pseudo-header with the
    ///  source address which is only known to the kernel, so the field is left at 0 for the kernel
    ///  to fill in.
    pub fn ser(&self, family: IpFamily, buf: &mut BytesMut) {
        let start = buf.len();

        buf.put_u8(self.kind.icmp_type(family));
        buf.put_u8(0); // code
        buf.put_u16(0); // checksum placeholder
        buf.put_u16(self.identifier);
        buf.put_u16(self.sequence);
        buf.put_slice(&self.payload);

        if family == IpFamily::V4 {
            let checksum = internet_checksum(&buf[start..]);
            buf[start+2..start+4].copy_from_slice(&checksum.to_be_bytes());
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum IcmpMessage {
    Echo(EchoMessage),
    /// any other ICMP message, e.g. 'destination unreachable' - only type and code are kept
    Other { icmp_type: u8, code: u8 },
}

impl IcmpMessage {
    /// Parses the ICMP part of a datagram, i.e. without an IP header.
    pub fn deser(family: IpFamily, buf: &[u8]) -> anyhow::Result<IcmpMessage> {
        if family == IpFamily::V4 && internet_checksum(buf) != 0 {
            return Err(anyhow!("ICMP checksum mismatch"));
        }

        let mut buf = buf;
        let icmp_type = checked_get_u8(&mut buf)?;
        let code = checked_get_u8(&mut buf)?;
        let _checksum = checked_get_u16(&mut buf)?;

        match EchoKind::from_icmp_type(family, icmp_type) {
            None => Ok(IcmpMessage::Other { icmp_type, code }),
            Some(kind) => {
                let identifier = checked_get_u16(&mut buf)?;
                let sequence = checked_get_u16(&mut buf)?;
                Ok(IcmpMessage::Echo(EchoMessage {
                    kind,
                    identifier,
                    sequence,
                    payload: Bytes::copy_from_slice(buf),
                }))
            }
        }
    }
}

/// RFC 1071 one's complement checksum. Calculating it over a message that contains a valid
///  checksum yields 0.
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u64 = 0;

    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u16::from_be_bytes([word[0], word[1]]) as u64;
    }
    if let [last] = words.remainder() {
        sum += (*last as u64) << 8;
    }

    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
