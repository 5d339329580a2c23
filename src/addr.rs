//! IPv4-mapped-IPv6 normal form for every internal address.
//!
//! Every socket address that crosses into a data structure (session key,
//! cache key, log field) is first normalized to a `SocketAddrV6` so v4 and
//! v6 flows share one comparison/hash/tree path, matching the teacher's
//! `msg_to_sock_addr`/`resolve_to_sockaddr` which always build the mapped
//! form on the C side.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};

/// Normalize any address to its IPv4-mapped-IPv6 form.
pub fn to_mapped(addr: SocketAddr) -> SocketAddrV6 {
    match addr {
        SocketAddr::V4(v4) => {
            SocketAddrV6::new(v4.ip().to_ipv6_mapped(), v4.port(), 0, 0)
        }
        SocketAddr::V6(v6) => v6,
    }
}

/// True if `addr` carries an embedded IPv4 address (`::ffff:a.b.c.d`).
pub fn is_v4_mapped(addr: &Ipv6Addr) -> bool {
    addr.to_ipv4_mapped().is_some()
}

/// Collapse a mapped address back to its IPv4 form wherever the wire
/// protocol wants atype=1 instead of atype=4 (spec.md §4.2: "Addresses are
/// sent IPv4-normalised").
pub fn unmap(addr: SocketAddrV6) -> SocketAddr {
    match addr.ip().to_ipv4_mapped() {
        Some(v4) => SocketAddr::V4(std::net::SocketAddrV4::new(v4, addr.port())),
        None => SocketAddr::V6(addr),
    }
}

/// Build a `SocketAddrV6` in mapped form straight from an IPv4 pair, as
/// `original_source`'s cmsg parsing does.
pub fn v4_as_mapped(ip: Ipv4Addr, port: u16) -> SocketAddrV6 {
    SocketAddrV6::new(ip.to_ipv6_mapped(), port, 0, 0)
}

pub fn unspecified_for(addr: &SocketAddrV6) -> IpAddr {
    if addr.ip().to_ipv4_mapped().is_some() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddrV4;

    #[test]
    fn v4_round_trips_through_mapped_form() {
        let v4 = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 80));
        let mapped = to_mapped(v4);
        assert!(is_v4_mapped(mapped.ip()));
        assert_eq!(unmap(mapped), v4);
    }

    #[test]
    fn v6_literal_is_unchanged() {
        let v6 = SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::LOCALHOST, 53, 0, 0));
        let mapped = to_mapped(v6);
        assert_eq!(unmap(mapped), v6);
    }
}
