use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut};

/// Ran out of bytes while decoding a packet.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Fail)]
#[fail(display = "unexpected end of packet")]
pub struct UnexpectedEnd;

pub type Result<T> = ::std::result::Result<T, UnexpectedEnd>;

/// A value with a fixed little-endian wire form.
pub trait Codec: Sized {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self>;
    fn encode<B: BufMut>(&self, buf: &mut B);
}

impl Codec for u8 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 1 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u8())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(*self);
    }
}

impl Codec for u16 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u16_le())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16_le(*self);
    }
}

impl Codec for u32 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 4 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u32_le())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(*self);
    }
}

impl Codec for u64 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 8 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u64_le())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(*self);
    }
}

impl Codec for SocketAddr {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let family = u8::decode(buf)?;
        let ip = match family {
            4 => {
                if buf.remaining() < 4 {
                    return Err(UnexpectedEnd);
                }
                let mut octets = [0; 4];
                buf.copy_to_slice(&mut octets);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            6 => {
                if buf.remaining() < 16 {
                    return Err(UnexpectedEnd);
                }
                let mut octets = [0; 16];
                buf.copy_to_slice(&mut octets);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            _ => {
                return Err(UnexpectedEnd);
            }
        };
        let port = u16::decode(buf)?;
        Ok(SocketAddr::new(ip, port))
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        match self.ip() {
            IpAddr::V4(ip) => {
                buf.put_u8(4);
                buf.put_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                buf.put_u8(6);
                buf.put_slice(&ip.octets());
            }
        }
        buf.put_u16_le(self.port());
    }
}

/// The canonical byte form of an address, as hashed into identity tokens.
pub fn address_bytes(addr: &SocketAddr) -> Vec<u8> {
    let mut buf = Vec::with_capacity(19);
    addr.encode(&mut buf);
    buf
}

pub trait BufExt {
    fn get<T: Codec>(&mut self) -> Result<T>;
    fn get_bytes(&mut self, len: usize) -> Result<Vec<u8>>;
    /// A `u16` length prefix followed by that many bytes, rejected past `max`.
    fn get_buffer(&mut self, max: usize) -> Result<Vec<u8>>;
}

impl<B: Buf> BufExt for B {
    fn get<T: Codec>(&mut self) -> Result<T> {
        T::decode(self)
    }

    fn get_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        if self.remaining() < len {
            return Err(UnexpectedEnd);
        }
        let mut bytes = vec![0; len];
        self.copy_to_slice(&mut bytes);
        Ok(bytes)
    }

    fn get_buffer(&mut self, max: usize) -> Result<Vec<u8>> {
        let len = u16::decode(self)? as usize;
        if len > max {
            return Err(UnexpectedEnd);
        }
        self.get_bytes(len)
    }
}

pub trait BufMutExt {
    fn write<T: Codec>(&mut self, x: T);
    /// A `u16` length prefix followed by the bytes.
    fn put_buffer(&mut self, data: &[u8]);
}

impl<B: BufMut> BufMutExt for B {
    fn write<T: Codec>(&mut self, x: T) {
        x.encode(self);
    }

    fn put_buffer(&mut self, data: &[u8]) {
        debug_assert!(data.len() <= u16::max_value() as usize);
        self.put_u16_le(data.len() as u16);
        self.put_slice(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trip() {
        let mut buf = Vec::new();
        buf.write(0xabu8);
        buf.write(0xbeef_u16);
        buf.write(0xdead_beef_u32);
        buf.write(0x0123_4567_89ab_cdef_u64);
        let mut r = &buf[..];
        assert_eq!(BufExt::get::<u8>(&mut r).unwrap(), 0xab);
        assert_eq!(BufExt::get::<u16>(&mut r).unwrap(), 0xbeef);
        assert_eq!(BufExt::get::<u32>(&mut r).unwrap(), 0xdead_beef);
        assert_eq!(BufExt::get::<u64>(&mut r).unwrap(), 0x0123_4567_89ab_cdef);
        assert_eq!(r.remaining(), 0);
        assert_eq!(BufExt::get::<u8>(&mut r), Err(UnexpectedEnd));
    }

    #[test]
    fn address_round_trip() {
        let addrs: [SocketAddr; 2] = ["127.0.0.1:28000".parse().unwrap(), "[::1]:9".parse().unwrap()];
        for addr in &addrs {
            let mut buf = Vec::new();
            SocketAddr::encode(addr, &mut buf);
            let mut r = &buf[..];
            assert_eq!(BufExt::get::<SocketAddr>(&mut r).unwrap(), *addr);
        }
    }

    #[test]
    fn buffer_length_limit() {
        let mut buf = Vec::new();
        buf.put_buffer(&[7; 16]);
        let mut r = &buf[..];
        assert_eq!(r.get_buffer(15), Err(UnexpectedEnd));
        let mut r = &buf[..];
        assert_eq!(r.get_buffer(16).unwrap(), vec![7; 16]);
    }

    #[test]
    fn truncated_buffer() {
        let mut buf = Vec::new();
        buf.put_buffer(&[1, 2, 3]);
        let mut r = &buf[..4];
        assert_eq!(r.get_buffer(64), Err(UnexpectedEnd));
    }
}
