//! Pure encode/decode helpers for the SOCKS5 wire format (RFC 1928/1929),
//! plus the two UDP relay framings spec.md §4.2 defines.

use std::net::{IpAddr, SocketAddr};

use smallvec::SmallVec;

use super::SocksError;
use crate::addr;

/// A SOCKS5 address/request/header is at most a handful of bytes longer
/// than an IPv6 literal; inline storage avoids a heap allocation on the
/// hot per-datagram encode path (spec.md §4.6 batches many of these per
/// UDP session).
pub type WireBuf = SmallVec<[u8; 32]>;

pub const VER: u8 = 0x05;
pub const METHOD_NONE: u8 = 0x00;
pub const METHOD_USER_PASS: u8 = 0x02;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xff;

const ATYPE_V4: u8 = 0x01;
const ATYPE_DOMAIN: u8 = 0x03;
const ATYPE_V6: u8 = 0x04;

/// Optional username/password for RFC 1929 sub-negotiation.
#[derive(Debug, Clone, Default)]
pub struct AuthInfo {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl AuthInfo {
    pub fn is_some(&self) -> bool {
        self.username.is_some()
    }
}

/// `{ ver=5, nmethods, methods }`.
pub fn encode_greeting(with_auth: bool) -> Vec<u8> {
    if with_auth {
        vec![VER, 2, METHOD_NONE, METHOD_USER_PASS]
    } else {
        vec![VER, 1, METHOD_NONE]
    }
}

/// `{ ver=1, ulen, user, plen, pass }`.
pub fn encode_user_pass(auth: &AuthInfo) -> Vec<u8> {
    let user = auth.username.as_deref().unwrap_or("").as_bytes();
    let pass = auth.password.as_deref().unwrap_or("").as_bytes();
    let mut buf = Vec::with_capacity(3 + user.len() + pass.len());
    buf.push(0x01);
    buf.push(user.len() as u8);
    buf.extend_from_slice(user);
    buf.push(pass.len() as u8);
    buf.extend_from_slice(pass);
    buf
}

/// Encode an address IPv4-normalized, as spec.md §4.2 requires: a mapped
/// IPv6 address that is really IPv4 is sent with atype=1.
pub fn encode_address(addr: SocketAddr, buf: &mut WireBuf) -> Result<(), SocksError> {
    match addr.ip() {
        IpAddr::V4(v4) => {
            buf.push(ATYPE_V4);
            buf.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                buf.push(ATYPE_V4);
                buf.extend_from_slice(&v4.octets());
            } else {
                buf.push(ATYPE_V6);
                buf.extend_from_slice(&v6.octets());
            }
        }
    }
    buf.extend_from_slice(&addr.port().to_be_bytes());
    Ok(())
}

pub fn encoded_address_len(addr: &SocketAddr) -> usize {
    match addr.ip() {
        IpAddr::V4(_) => 1 + 4 + 2,
        IpAddr::V6(v6) => {
            if v6.to_ipv4_mapped().is_some() {
                1 + 4 + 2
            } else {
                1 + 16 + 2
            }
        }
    }
}

/// `{ ver=5, cmd, rsv=0, atype, addr, port }`.
pub fn encode_request(cmd: u8, target: SocketAddr) -> Result<WireBuf, SocksError> {
    let mut buf = WireBuf::with_capacity(4 + encoded_address_len(&target));
    buf.push(VER);
    buf.push(cmd);
    buf.push(0x00);
    encode_address(target, &mut buf)?;
    Ok(buf)
}

/// Decode `{ atype, addr, port }` from the head of `buf`, returning the
/// address and the number of bytes consumed.
pub fn decode_address(buf: &[u8]) -> Result<(SocketAddr, usize), SocksError> {
    if buf.is_empty() {
        return Err(SocksError::Truncated);
    }
    let atype = buf[0];
    match atype {
        ATYPE_V4 => {
            if buf.len() < 1 + 4 + 2 {
                return Err(SocksError::Truncated);
            }
            let ip = std::net::Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
            let port = u16::from_be_bytes([buf[5], buf[6]]);
            Ok((SocketAddr::new(IpAddr::V4(ip), port), 1 + 4 + 2))
        }
        ATYPE_V6 => {
            if buf.len() < 1 + 16 + 2 {
                return Err(SocksError::Truncated);
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[1..17]);
            let ip = std::net::Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([buf[17], buf[18]]);
            Ok((SocketAddr::new(IpAddr::V6(ip), port), 1 + 16 + 2))
        }
        ATYPE_DOMAIN => {
            if buf.len() < 2 {
                return Err(SocksError::Truncated);
            }
            let len = buf[1] as usize;
            if buf.len() < 2 + len + 2 {
                return Err(SocksError::Truncated);
            }
            // the forwarder never asks for domain resolution on replies; a
            // server that sends one back is still well formed, so skip it
            // rather than fail the session.
            let port = u16::from_be_bytes([buf[2 + len], buf[2 + len + 1]]);
            let placeholder = SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), port);
            Ok((placeholder, 2 + len + 2))
        }
        other => Err(SocksError::UnsupportedAddressType(other)),
    }
}

/// SOCKS5 UDP relay header: `{ rsv=0, rsv=0, frag=0, atype, addr, port }`
/// used to wrap each datagram in both UDP-in-UDP and UDP-in-TCP framings
/// (spec.md §4.2).
#[derive(Debug, Default, Clone)]
pub struct UdpHeader;

impl UdpHeader {
    /// Encode the 4-or-more byte header for `dst`, UDP-in-UDP framing.
    pub fn encode(dst: SocketAddr) -> Result<WireBuf, SocksError> {
        let mut buf = WireBuf::with_capacity(4 + encoded_address_len(&dst));
        buf.push(0x00);
        buf.push(0x00);
        buf.push(0x00); // FRAG, no fragmentation support
        encode_address(dst, &mut buf)?;
        Ok(buf)
    }

    /// Parse the header off the front of a UDP-in-UDP datagram, returning
    /// the source address it names and the offset the payload starts at.
    pub fn decode(buf: &[u8]) -> Result<(SocketAddr, usize), SocksError> {
        if buf.len() < 4 {
            return Err(SocksError::Truncated);
        }
        if buf[2] != 0x00 {
            // fragmented datagrams are not supported; surface as truncated
            // so the caller drops the packet per spec.md §7 "per-datagram
            // transient" policy.
            return Err(SocksError::Truncated);
        }
        let (src, consumed) = decode_address(&buf[3..])?;
        Ok((src, 3 + consumed))
    }

    /// Frame a single datagram for the UDP-in-TCP control channel:
    /// `{ u16 length, socks5_addr, payload }` (spec.md §4.2).
    pub fn encode_framed(dst: SocketAddr, payload: &[u8]) -> Result<Vec<u8>, SocksError> {
        let mut addr_buf = WireBuf::with_capacity(encoded_address_len(&dst));
        encode_address(dst, &mut addr_buf)?;
        let total = addr_buf.len() + payload.len();
        let mut out = Vec::with_capacity(2 + total);
        out.extend_from_slice(&(total as u16).to_be_bytes());
        out.extend_from_slice(&addr_buf);
        out.extend_from_slice(payload);
        Ok(out)
    }
}

/// IPv4-normalize a socket address as it will be placed on the wire,
/// exposed for callers building requests from mapped internal addresses.
pub fn normalize(a: SocketAddr) -> SocketAddr {
    addr::unmap(addr::to_mapped(a))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[test]
    fn request_roundtrips_v4_mapped_address() {
        let mapped = addr::v4_as_mapped(Ipv4Addr::new(93, 184, 216, 34), 80);
        let target = addr::unmap(mapped);
        let req = encode_request(0x01, target).unwrap();
        assert_eq!(&req[..3], &[VER, 0x01, 0x00]);
        let (decoded, consumed) = decode_address(&req[3..]).unwrap();
        assert_eq!(consumed, req.len() - 3);
        assert_eq!(
            decoded,
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 80))
        );
        assert_eq!(req[3], ATYPE_V4);
    }

    #[test]
    fn udp_header_roundtrips() {
        let dst = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53));
        let framed = UdpHeader::encode(dst).unwrap();
        let (decoded, off) = UdpHeader::decode(&framed).unwrap();
        assert_eq!(decoded, dst);
        assert_eq!(off, framed.len());
    }

    #[test]
    fn framed_tcp_udp_carries_length_prefix() {
        let dst = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53));
        let payload = b"HELLO";
        let framed = UdpHeader::encode_framed(dst, payload).unwrap();
        let len = u16::from_be_bytes([framed[0], framed[1]]) as usize;
        assert_eq!(len, framed.len() - 2);
        assert!(framed.ends_with(payload));
    }
}
