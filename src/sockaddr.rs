//! `sockaddr_in` / `sockaddr_in6` in the Winsock byte layout.
//!
//! The family and the IPv6 flow and scope fields are host order, the port is
//! network order.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

pub const AF_UNSPEC: i32 = 0;
pub const AF_INET: i32 = 2;
pub const AF_INET6: i32 = 23;

pub const SOCKADDR_IN_LEN: usize = 16;
pub const SOCKADDR_IN6_LEN: usize = 28;
/// `sizeof(SOCKADDR_STORAGE)`.
pub const SOCKADDR_STORAGE_LEN: usize = 128;

/// Encoded address, large enough for any family.
#[repr(C, align(8))]
#[derive(Clone, Copy)]
pub struct SockAddrBuf {
    bytes: [u8; SOCKADDR_STORAGE_LEN],
    len: usize,
}

impl SockAddrBuf {
    /// Zeroed storage for the kernel to fill.
    pub fn storage() -> Self {
        Self { bytes: [0; SOCKADDR_STORAGE_LEN], len: SOCKADDR_STORAGE_LEN }
    }

    pub fn encode(addr: &SocketAddr) -> Self {
        let mut buf = Self::storage();
        match addr {
            SocketAddr::V4(v4) => {
                buf.bytes[0..2].copy_from_slice(&(AF_INET as u16).to_ne_bytes());
                buf.bytes[2..4].copy_from_slice(&v4.port().to_be_bytes());
                buf.bytes[4..8].copy_from_slice(&v4.ip().octets());
                buf.len = SOCKADDR_IN_LEN;
            }
            SocketAddr::V6(v6) => {
                buf.bytes[0..2].copy_from_slice(&(AF_INET6 as u16).to_ne_bytes());
                buf.bytes[2..4].copy_from_slice(&v6.port().to_be_bytes());
                buf.bytes[4..8].copy_from_slice(&v6.flowinfo().to_ne_bytes());
                buf.bytes[8..24].copy_from_slice(&v6.ip().octets());
                buf.bytes[24..28].copy_from_slice(&v6.scope_id().to_ne_bytes());
                buf.len = SOCKADDR_IN6_LEN;
            }
        }
        buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.bytes.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.bytes.as_mut_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Record how many bytes the kernel wrote.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(SOCKADDR_STORAGE_LEN);
    }

    pub fn decode(&self) -> Option<SocketAddr> {
        decode(self.as_bytes())
    }
}

/// Decode the address in `bytes`; `None` for a short buffer or a foreign
/// family.
pub fn decode(bytes: &[u8]) -> Option<SocketAddr> {
    let field = |at: usize| -> Option<[u8; 4]> { bytes.get(at..at + 4)?.try_into().ok() };
    let family = u16::from_ne_bytes(bytes.get(0..2)?.try_into().ok()?);
    let port = u16::from_be_bytes(bytes.get(2..4)?.try_into().ok()?);
    match i32::from(family) {
        AF_INET if bytes.len() >= SOCKADDR_IN_LEN => {
            Some(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(field(4)?), port)))
        }
        AF_INET6 if bytes.len() >= SOCKADDR_IN6_LEN => {
            let octets: [u8; 16] = bytes.get(8..24)?.try_into().ok()?;
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(octets),
                port,
                u32::from_ne_bytes(field(4)?),
                u32::from_ne_bytes(field(24)?),
            )))
        }
        _ => None,
    }
}

pub fn family(addr: &SocketAddr) -> i32 {
    match addr {
        SocketAddr::V4(_) => AF_INET,
        SocketAddr::V6(_) => AF_INET6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inet_layout() {
        let addr: SocketAddr = "10.1.2.3:8080".parse().unwrap();
        let buf = SockAddrBuf::encode(&addr);
        assert_eq!(buf.len(), SOCKADDR_IN_LEN);
        assert_eq!(&buf.as_bytes()[2..8], &[0x1f, 0x90, 10, 1, 2, 3]);
        assert_eq!(buf.decode(), Some(addr));
    }

    #[test]
    fn test_inet6_keeps_scope() {
        let addr = SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::LOCALHOST, 443, 0, 7));
        let buf = SockAddrBuf::encode(&addr);
        assert_eq!(buf.len(), SOCKADDR_IN6_LEN);
        assert_eq!(decode(buf.as_bytes()), Some(addr));
    }

    #[test]
    fn test_rejects_short_and_foreign() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let buf = SockAddrBuf::encode(&addr);
        assert_eq!(decode(&buf.as_bytes()[..8]), None);
        assert_eq!(decode(&[1, 0, 0, 0]), None);
        assert_eq!(decode(&[]), None);
    }
}
