use std::mem::size_of;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use anyhow::anyhow;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

macro_rules! checked_get_impl {
    ($name: ident, $ty:ty, $getter: ident) => {
        pub fn $name(buf: &mut impl Buf) -> anyhow::Result<$ty> {
            if buf.remaining() < size_of::<$ty>() {
                return Err(anyhow!("buffer underflow"));
            }
            Ok(buf.$getter())
        }
    }
}

checked_get_impl!(checked_get_u8, u8, get_u8);
checked_get_impl!(checked_get_u16, u16, get_u16);
checked_get_impl!(checked_get_u64, u64, get_u64);
checked_get_impl!(checked_get_i64, i64, get_i64);

pub fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_usize_varint(s.len());
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let len = buf.try_get_usize_varint()?;
    if buf.remaining() < len {
        return Err(anyhow!("string length {} exceeds remaining buffer of {} bytes", len, buf.remaining()));
    }
    let mut result = vec![0u8; len];
    buf.copy_to_slice(&mut result);

    let s = String::from_utf8(result)?;
    Ok(s)
}

const FAMILY_TAG_V4: u8 = 4;
const FAMILY_TAG_V6: u8 = 6;

pub fn put_ip_addr(buf: &mut BytesMut, addr: &IpAddr) {
    match addr {
        IpAddr::V4(a) => {
            buf.put_u8(FAMILY_TAG_V4);
            buf.put_slice(&a.octets());
        }
        IpAddr::V6(a) => {
            buf.put_u8(FAMILY_TAG_V6);
            buf.put_slice(&a.octets());
        }
    }
}

pub fn try_get_ip_addr(buf: &mut impl Buf) -> anyhow::Result<IpAddr> {
    match checked_get_u8(buf)? {
        FAMILY_TAG_V4 => {
            let mut octets = [0u8; 4];
            try_copy_to_slice(buf, &mut octets)?;
            Ok(Ipv4Addr::from(octets).into())
        }
        FAMILY_TAG_V6 => {
            let mut octets = [0u8; 16];
            try_copy_to_slice(buf, &mut octets)?;
            Ok(Ipv6Addr::from(octets).into())
        }
        tag => Err(anyhow!("invalid address family tag {}", tag)),
    }
}

fn try_copy_to_slice(buf: &mut impl Buf, target: &mut [u8]) -> anyhow::Result<()> {
    if buf.remaining() < target.len() {
        return Err(anyhow!("buffer underflow"));
    }
    buf.copy_to_slice(target);
    Ok(())
}
