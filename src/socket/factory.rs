//! M1 Socket factory (spec.md §4.4).
//!
//! Builds a dual-stack `AF_INET6` listening/IP_TRANSPARENT socket with the
//! exact option matrix spec.md lists, mandatory options failing fatally
//! and best-effort options only warning. Grounded on
//! `original_source/src/hev-socket-factory.c` (`hev_socket_factory_get`,
//! `_tcp`, `_udp`), translated from raw `setsockopt` calls to `socket2`.

use std::io;
use std::net::SocketAddr;

use log::warn;
use socket2::{Domain, Socket, Type};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Stream,
    Dgram,
}

/// Build a bound (and, for `Stream`, listening) transparent socket at
/// `addr`. `force_reuseport` is true for every worker but the main one
/// (spec.md §4.4: "when `force_reuseport` is true, failure is fatal...;
/// when false, failure is tolerated").
pub fn bind_listener(
    addr: SocketAddr,
    kind: SocketKind,
    force_reuseport: bool,
    udp_recv_buffer_size: usize,
) -> io::Result<Socket> {
    let socket = Socket::new(
        Domain::IPV6,
        match kind {
            SocketKind::Stream => Type::STREAM,
            SocketKind::Dgram => Type::DGRAM,
        },
        None,
    )?;

    socket.set_reuse_address(true)?;

    if let Err(e) = socket.set_reuse_port(true) {
        if force_reuseport {
            return Err(e);
        }
        warn!("socket factory: SO_REUSEPORT on {addr}: {e}");
    }

    set_ip_transparent(&socket)?;
    set_ipv6_transparent(&socket)?;

    socket.bind(&addr.into())?;

    match kind {
        SocketKind::Stream => {
            socket.listen(100)?;
        }
        SocketKind::Dgram => {
            set_recv_orig_dst_addr(&socket)?;
            if let Err(e) = socket.set_recv_buffer_size(udp_recv_buffer_size) {
                warn!("socket factory: SO_RCVBUF on {addr}: {e}");
            }
        }
    }

    Ok(socket)
}

/// Bind a UDP reply socket to `peer_addr` under `IPV6_TRANSPARENT`, used
/// by the transparent-socket cache (L3, spec.md §4.3) to forge replies
/// from the original destination. Grounded on
/// `original_source/src/hev-tsocks-cache.c` (`hev_tsocks_cache_tsock_new`).
pub fn bind_transparent_reply_socket(peer_addr: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    set_ipv6_transparent(&socket)?;
    socket.bind(&peer_addr.into())?;
    Ok(socket)
}

#[cfg(target_os = "linux")]
fn set_ip_transparent(socket: &Socket) -> io::Result<()> {
    set_bool_opt(socket, libc::IPPROTO_IP, libc::IP_TRANSPARENT)
}

#[cfg(target_os = "linux")]
fn set_ipv6_transparent(socket: &Socket) -> io::Result<()> {
    set_bool_opt(socket, libc::IPPROTO_IPV6, libc::IPV6_TRANSPARENT)
}

#[cfg(target_os = "linux")]
fn set_recv_orig_dst_addr(socket: &Socket) -> io::Result<()> {
    set_bool_opt(socket, libc::IPPROTO_IP, libc::IP_RECVORIGDSTADDR)?;
    set_bool_opt(socket, libc::IPPROTO_IPV6, libc::IPV6_RECVORIGDSTADDR)
}

#[cfg(not(target_os = "linux"))]
fn set_ip_transparent(_socket: &Socket) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "IP_TRANSPARENT requires Linux",
    ))
}

#[cfg(not(target_os = "linux"))]
fn set_ipv6_transparent(_socket: &Socket) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "IPV6_TRANSPARENT requires Linux",
    ))
}

#[cfg(not(target_os = "linux"))]
fn set_recv_orig_dst_addr(_socket: &Socket) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "IP_RECVORIGDSTADDR requires Linux",
    ))
}

#[cfg(target_os = "linux")]
fn set_bool_opt(socket: &Socket, level: libc::c_int, name: libc::c_int) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let one: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            name,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Apply `SO_MARK` to an outgoing dial socket (spec.md §4.5 step 2,
/// §4.7 step 1). A mark of 0 is a no-op (not configured). Takes anything
/// with a raw fd — a freshly built `socket2::Socket` before conversion
/// to a tokio type, or a `socket2::SockRef` borrowed from an already-
/// connected `TcpStream`.
#[cfg(target_os = "linux")]
pub fn set_mark(socket: &impl std::os::unix::io::AsRawFd, mark: u32) -> io::Result<()> {
    if mark == 0 {
        return Ok(());
    }
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_MARK,
            &mark as *const _ as *const libc::c_void,
            std::mem::size_of::<u32>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_mark(_socket: &impl std::os::unix::io::AsRawFd, _mark: u32) -> io::Result<()> {
    Ok(())
}
